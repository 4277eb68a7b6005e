// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::error::Error;
use std::fmt::Write;

/// Render `top_error` and every error below it, one per line, the way the
/// command line tools of the workspace report failures.
pub fn format_error_chain(top_error: &dyn Error, component: &str) -> String {
    let mut out = String::new();
    let _ = write!(out, "Error: {component} failed with the following ");
    if top_error.source().is_none() {
        let _ = writeln!(out, "error:");
        let _ = writeln!(out, "  {top_error}");
        return out;
    }

    let _ = writeln!(out, "chain of errors:");
    std::iter::successors(Some(top_error), |e| (*e).source())
        .enumerate()
        .for_each(|(level, e)| {
            let _ = writeln!(out, "  {level}: {e}");
        });
    out
}

/// Print the error chain of `top_error` on stderr, followed by its debug
/// representation.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    eprint!("{}", format_error_chain(top_error, component));
    eprintln!();
    eprintln!("Debug Info: {top_error:?}");
}
