// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use clap::builder::PossibleValuesParser;
use clap::{Arg, ArgAction, ArgMatches, Command};
use launcher::config::{self, DEFAULT_FORWARD_PORT, DEFAULT_MEMORY, DEFAULT_MONITOR_PORT};
use launcher::{launch, BootType, ConsoleMode, HostPaths, LaunchConfig, VmType};
use log::LevelFilter;
use net_util::MacAddr;
use td_launcher::cli_print_error_chain;
use thiserror::Error;

#[derive(Error, Debug)]
enum Error {
    #[error("Error determining the working directory")]
    WorkDir(#[source] std::io::Error),
    #[error("Error loading host configuration")]
    HostConfig(#[source] config::Error),
    #[error("Error parsing command line")]
    Config(#[source] config::Error),
    #[error("Error preparing the VM launch")]
    Prepare(#[source] launcher::Error),
    #[error("Error running the hypervisor")]
    Launch(#[source] launch::Error),
}

fn get_cli_options_sorted() -> Box<[Arg]> {
    [
        Arg::new("boot")
            .long("boot")
            .short('b')
            .help("Boot type: \"direct\" hands the kernel to QEMU, \"grub\" boots from the image")
            .value_parser(PossibleValuesParser::new(BootType::NAMES))
            .default_value("direct"),
        Arg::new("cpus")
            .long("cpus")
            .short('c')
            .help("Number of virtual CPUs")
            .value_parser(clap::value_parser!(u32))
            .default_value(config::DEFAULT_VCPUS.to_string()),
        Arg::new("debug")
            .long("debug")
            .short('d')
            .help("Enable TD debug=on and wait for GDB on tcp::1234")
            .action(ArgAction::SetTrue),
        Arg::new("dry-run")
            .long("dry-run")
            .help(
                "Check the host and print the hypervisor command line without launching it \
                 or creating the firmware vars copy",
            )
            .action(ArgAction::SetTrue),
        Arg::new("extra-cmdline")
            .long("extra-cmdline")
            .short('e')
            .help("Extra kernel command line for direct boot")
            .num_args(1),
        Arg::new("forward-port")
            .long("forward-port")
            .short('f')
            .help("Host port forwarded to the guest SSH port")
            .value_parser(clap::value_parser!(u16))
            .default_value(DEFAULT_FORWARD_PORT.to_string()),
        Arg::new("host-config")
            .long("host-config")
            .help("JSON file overriding hypervisor and firmware locations")
            .value_parser(clap::value_parser!(PathBuf)),
        Arg::new("image")
            .long("image")
            .short('i')
            .help(format!(
                "Guest image file, default is {} under the working directory",
                config::DEFAULT_GUEST_IMAGE
            ))
            .value_parser(clap::value_parser!(PathBuf)),
        Arg::new("kernel")
            .long("kernel")
            .short('k')
            .help(format!(
                "Kernel image for direct boot, default is {} under the working directory",
                config::DEFAULT_KERNEL
            ))
            .value_parser(clap::value_parser!(PathBuf)),
        Arg::new("mac")
            .long("mac")
            .short('m')
            .help("Guest MAC address <11:22:33:44:55:66>, part of the TD measurement")
            .value_parser(MacAddr::from_str),
        Arg::new("memory")
            .long("memory")
            .help("Guest memory size <number>[K|M|G|T]")
            .value_parser(config::parse_memory_size)
            .default_value(DEFAULT_MEMORY),
        Arg::new("monitor-port")
            .long("monitor-port")
            .short('p')
            .help("Port of the telnet monitor on 127.0.0.1")
            .value_parser(clap::value_parser!(u16))
            .default_value(DEFAULT_MONITOR_PORT.to_string()),
        Arg::new("ovmf-code")
            .long("ovmf-code")
            .short('o')
            .help("OVMF code firmware file, for \"td\" and \"efi\" VMs only")
            .value_parser(clap::value_parser!(PathBuf)),
        Arg::new("ovmf-vars")
            .long("ovmf-vars")
            .short('a')
            .help("OVMF vars file or template, for \"td\" and \"efi\" VMs only")
            .value_parser(clap::value_parser!(PathBuf)),
        Arg::new("root-partition")
            .long("root-partition")
            .short('r')
            .help("Root partition for direct boot")
            .default_value(config::DEFAULT_ROOT_PARTITION),
        Arg::new("serial")
            .long("serial")
            .short('s')
            .help("Use a serial console instead of the HVC console")
            .action(ArgAction::SetTrue),
        Arg::new("verbose")
            .long("verbose")
            .help("Sets the level of debugging output")
            .action(ArgAction::Count),
        Arg::new("vm-type")
            .long("vm-type")
            .short('t')
            .help("VM type")
            .value_parser(PossibleValuesParser::new(VmType::NAMES))
            .default_value("td"),
        Arg::new("vsock")
            .long("vsock")
            .short('v')
            .help("Add a vhost-vsock device")
            .action(ArgAction::SetTrue),
        Arg::new("workdir")
            .long("workdir")
            .help("Directory holding the default image and kernel, the vars copy and console logs")
            .value_parser(clap::value_parser!(PathBuf)),
    ]
    .to_vec()
    .into_boxed_slice()
}

fn create_app() -> Command {
    Command::new("td-launcher")
        .version(env!("BUILD_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Launch a QEMU/KVM guest as a legacy, EFI or TDX trust domain VM.")
        .args(get_cli_options_sorted())
}

fn launch_config(cmd_arguments: &ArgMatches) -> Result<LaunchConfig, Error> {
    let host = match cmd_arguments.get_one::<PathBuf>("host-config") {
        Some(path) => HostPaths::from_file(path).map_err(Error::HostConfig)?,
        None => HostPaths::default(),
    };
    let workdir = match cmd_arguments.get_one::<PathBuf>("workdir") {
        Some(dir) => dir.clone(),
        None => env::current_dir().map_err(Error::WorkDir)?,
    };

    let mut config = LaunchConfig::new(host, workdir);

    if let Some(image) = cmd_arguments.get_one::<PathBuf>("image") {
        config.image = image.clone();
    }
    if let Some(kernel) = cmd_arguments.get_one::<PathBuf>("kernel") {
        config.kernel = kernel.clone();
    }
    if let Some(code) = cmd_arguments.get_one::<PathBuf>("ovmf-code") {
        config.ovmf_code = code.clone();
    }
    if let Some(vars) = cmd_arguments.get_one::<PathBuf>("ovmf-vars") {
        config.ovmf_vars = vars.clone();
    }

    // These .unwrap()s cannot fail as there is a default value defined
    config.vm_type = cmd_arguments
        .get_one::<String>("vm-type")
        .unwrap()
        .parse()
        .map_err(Error::Config)?;
    config.boot = cmd_arguments
        .get_one::<String>("boot")
        .unwrap()
        .parse()
        .map_err(Error::Config)?;
    config.cpus = *cmd_arguments.get_one::<u32>("cpus").unwrap();
    config.memory = cmd_arguments.get_one::<String>("memory").unwrap().clone();
    config.monitor_port = *cmd_arguments.get_one::<u16>("monitor-port").unwrap();
    config.forward_port = *cmd_arguments.get_one::<u16>("forward-port").unwrap();
    config.root_partition = cmd_arguments
        .get_one::<String>("root-partition")
        .unwrap()
        .clone();

    config.mac = cmd_arguments.get_one::<MacAddr>("mac").copied();
    config.extra_cmdline = cmd_arguments.get_one::<String>("extra-cmdline").cloned();
    config.vsock = cmd_arguments.get_flag("vsock");
    config.debug = cmd_arguments.get_flag("debug");
    config.dry_run = cmd_arguments.get_flag("dry-run");
    if cmd_arguments.get_flag("serial") {
        config.console = ConsoleMode::Serial;
    }

    Ok(config)
}

fn start_launcher(cmd_arguments: &ArgMatches) -> Result<i32, Error> {
    let config = launch_config(cmd_arguments)?;
    let plan = launcher::prepare(config).map_err(Error::Prepare)?;
    let command = plan.command();

    println!("{}", plan.summary());
    if plan.config.dry_run {
        println!("{command}");
        return Ok(0);
    }

    println!("Launch VM:");
    println!("{command}");
    let status = launch::run(&command).map_err(Error::Launch)?;

    Ok(launch::exit_code(status))
}

fn main() {
    let cmd_arguments = create_app().get_matches();

    let log_level = match cmd_arguments.get_count("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    let exit_code = match start_launcher(&cmd_arguments) {
        Ok(code) => code,
        Err(top_error) => {
            cli_print_error_chain(&top_error, "td-launcher");
            1
        }
    };

    std::process::exit(exit_code);
}

#[cfg(test)]
mod unit_tests {
    use std::cmp::Ordering;
    use std::collections::HashSet;
    use std::path::Path;

    use clap::error::ErrorKind;

    use super::*;

    fn matches(args: &[&str]) -> ArgMatches {
        create_app()
            .try_get_matches_from(std::iter::once("td-launcher").chain(args.iter().copied()))
            .unwrap()
    }

    fn config(args: &[&str]) -> LaunchConfig {
        let mut all = vec!["--workdir", "/srv/vm"];
        all.extend_from_slice(args);
        launch_config(&matches(&all)).unwrap()
    }

    #[test]
    fn test_cli_options_sorted_and_unique() {
        let options = get_cli_options_sorted();
        for (arg, next) in options.iter().zip(options.iter().skip(1)) {
            assert_ne!(
                arg.get_id().cmp(next.get_id()),
                Ordering::Greater,
                "args not alphabetically sorted: arg={}, next={}",
                arg.get_id(),
                next.get_id()
            );
        }

        let mut shorts = HashSet::new();
        for short in options.iter().filter_map(Arg::get_short) {
            assert!(shorts.insert(short), "short flag -{short} used twice");
        }
    }

    #[test]
    fn test_defaults() {
        let c = config(&[]);
        assert_eq!(c.workdir, Path::new("/srv/vm"));
        assert_eq!(c.image, Path::new("/srv/vm/td-guest.qcow2"));
        assert_eq!(c.kernel, Path::new("/srv/vm/vmlinuz"));
        assert_eq!(c.vm_type, VmType::Td);
        assert_eq!(c.boot, BootType::Direct);
        assert_eq!(c.cpus, 1);
        assert_eq!(c.memory, "2G");
        assert_eq!(c.monitor_port, 9001);
        assert_eq!(c.forward_port, 10026);
        assert_eq!(c.ovmf_vars, Path::new(config::DEFAULT_OVMF_VARS_TEMPLATE));
        assert_eq!(c.console, ConsoleMode::Hvc);
        assert_eq!(c.mac, None);
        assert!(!c.vsock && !c.debug && !c.dry_run);
        assert!(config(&["--dry-run"]).dry_run);
    }

    #[test]
    fn test_short_flags() {
        let c = config(&[
            "-i", "/img/guest.img", "-k", "/boot/vmlinuz-6.8", "-t", "efi", "-b", "grub", "-p",
            "9100", "-f", "2222", "-o", "/fw/code.fd", "-a", "/fw/vars.fd", "-m",
            "52:54:00:AB:CD:EF", "-c", "8", "-r", "/dev/vda3", "-e", "nokaslr", "-v", "-d", "-s",
        ]);
        assert_eq!(c.image, Path::new("/img/guest.img"));
        assert_eq!(c.kernel, Path::new("/boot/vmlinuz-6.8"));
        assert_eq!(c.vm_type, VmType::Efi);
        assert_eq!(c.boot, BootType::Grub);
        assert_eq!(c.monitor_port, 9100);
        assert_eq!(c.forward_port, 2222);
        assert_eq!(c.ovmf_code, Path::new("/fw/code.fd"));
        assert_eq!(c.ovmf_vars, Path::new("/fw/vars.fd"));
        assert_eq!(c.mac.unwrap().to_string(), "52:54:00:ab:cd:ef");
        assert_eq!(c.cpus, 8);
        assert_eq!(c.root_partition, "/dev/vda3");
        assert_eq!(c.extra_cmdline.as_deref(), Some("nokaslr"));
        assert!(c.vsock && c.debug);
        assert_eq!(c.console, ConsoleMode::Serial);
    }

    #[test]
    fn test_invalid_values_are_usage_errors() {
        let err = |args: &[&str]| {
            create_app()
                .try_get_matches_from(std::iter::once("td-launcher").chain(args.iter().copied()))
                .unwrap_err()
                .kind()
        };
        assert_eq!(err(&["-t", "sev"]), ErrorKind::InvalidValue);
        assert_eq!(err(&["-b", "pxe"]), ErrorKind::InvalidValue);
        assert_eq!(err(&["-m", "52:54:00:ab:cd"]), ErrorKind::ValueValidation);
        assert_eq!(err(&["--memory", "lots"]), ErrorKind::ValueValidation);
        assert_eq!(err(&["-p", "70000"]), ErrorKind::ValueValidation);
        assert_eq!(err(&["--unknown"]), ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_missing_host_config() {
        let m = matches(&["--host-config", "/nonexistent/host.json"]);
        assert!(matches!(launch_config(&m), Err(Error::HostConfig(_))));
    }
}
