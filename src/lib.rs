// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;

/// Prints a chain of errors to the user in a consistent manner.
/// The user will see a clear chain of errors, followed by debug output
/// for opening issues.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    eprint!("{}", format_error_chain(top_error, component));
}

/// Renders what [`cli_print_error_chain`] prints.
pub fn format_error_chain(top_error: &dyn Error, component: &str) -> String {
    let mut out = format!("Error: {component} exited with the following ");
    if top_error.source().is_none() {
        out.push_str("error:\n");
        out.push_str(&format!("  {top_error}\n"));
    } else {
        out.push_str("chain of errors:\n");
        std::iter::successors(Some(top_error), |sub_error| {
            // Dereference necessary to mitigate rustc compiler bug.
            // See <https://github.com/rust-lang/rust/issues/141673>
            (*sub_error).source()
        })
        .enumerate()
        .for_each(|(level, error)| {
            out.push_str(&format!("  {level}: {error}\n"));
        });
    }

    out.push('\n');
    out.push_str(&format!("Debug Info: {top_error:?}\n"));
    out
}

#[cfg(test)]
mod tests {
    use std::io;

    use thiserror::Error;

    use super::*;

    #[derive(Error, Debug)]
    enum Outer {
        #[error("Error preparing the VM launch")]
        Prepare(#[source] io::Error),
        #[error("Nothing below")]
        Leaf,
    }

    #[test]
    fn test_error_chain_is_numbered() {
        let e = Outer::Prepare(io::Error::other("guest image missing"));
        let out = format_error_chain(&e, "td-launcher");
        assert!(out.starts_with("Error: td-launcher exited with the following chain of errors:\n"));
        assert!(out.contains("  0: Error preparing the VM launch\n"));
        assert!(out.contains("  1: guest image missing\n"));
        assert!(out.contains("Debug Info: Prepare("));
    }

    #[test]
    fn test_single_error() {
        let out = format_error_chain(&Outer::Leaf, "td-launcher");
        assert!(out.contains("following error:\n  Nothing below\n"));
    }
}
