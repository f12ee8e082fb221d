// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::result;

use thiserror::Error;

use crate::config::LaunchConfig;

/// Name of the per-VM variable store instantiated from the shared template.
pub const VARS_FILE_NAME: &str = "OVMF_VARS.fd";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Legacy BIOS {0:?} does not exist")]
    LegacyBiosMissing(PathBuf),
    #[error("Firmware code file {0:?} does not exist")]
    CodeMissing(PathBuf),
    #[error("Firmware vars file {0:?} does not exist")]
    VarsMissing(PathBuf),
    #[error("Error copying firmware vars template {0:?} to {1:?}")]
    CopyVarsTemplate(PathBuf, PathBuf, #[source] io::Error),
    #[error("Error resolving firmware path {0:?}")]
    Canonicalize(PathBuf, #[source] io::Error),
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Firmware {
    LegacyBios(PathBuf),
    Ovmf { code: PathBuf, vars: PathBuf },
}

impl Firmware {
    /// Locates the firmware for the configured VM type, creating the
    /// writable vars file on first use.
    pub fn resolve(config: &LaunchConfig) -> Result<Self> {
        if !config.vm_type.uses_ovmf() {
            let bios = &config.host.legacy_bios;
            if !bios.is_file() {
                return Err(Error::LegacyBiosMissing(bios.clone()));
            }
            return Ok(Firmware::LegacyBios(canonicalize(bios)?));
        }

        if !config.ovmf_code.is_file() {
            return Err(Error::CodeMissing(config.ovmf_code.clone()));
        }

        let vars = if same_file(&config.ovmf_vars, &config.host.ovmf_vars_template) {
            instantiate_vars(&config.ovmf_vars, &config.workdir, config.dry_run)?
        } else {
            if !config.ovmf_vars.is_file() {
                return Err(Error::VarsMissing(config.ovmf_vars.clone()));
            }
            canonicalize(&config.ovmf_vars)?
        };

        Ok(Firmware::Ovmf {
            code: canonicalize(&config.ovmf_code)?,
            vars,
        })
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).map_err(|e| Error::Canonicalize(path.to_owned(), e))
}

/// True when both paths name the same file, however they are spelled.
fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// The template is shared by every guest on the host, so each working
/// directory gets its own copy. An existing copy keeps its variables.
/// A dry run only reports where the copy would go.
fn instantiate_vars(template: &Path, workdir: &Path, dry_run: bool) -> Result<PathBuf> {
    let vars = canonicalize(workdir)?.join(VARS_FILE_NAME);
    if vars.exists() {
        debug!("Reusing firmware vars {vars:?}");
        return Ok(vars);
    }
    if !template.is_file() {
        return Err(Error::VarsMissing(template.to_owned()));
    }
    if dry_run {
        info!("Dry run, not creating firmware vars {vars:?}");
        return Ok(vars);
    }

    fs::copy(template, &vars)
        .map_err(|e| Error::CopyVarsTemplate(template.to_owned(), vars.clone(), e))?;
    info!("Created firmware vars {vars:?} from template {template:?}");

    Ok(vars)
}
