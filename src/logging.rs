// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Log output of the node binary and the local cluster.
//!
//! Library code only uses the [`log`] macros. A local cluster runs many
//! engines in one process, so the compact layout tags each line with the
//! crate module it came from (`engine`, `peer`, `strategy`, ...). Lines of
//! other crates are printed untagged.
//!
//! `RUST_LOG` overrides [`DEFAULT_FILTER`].

use logforth::color::LevelColor;
use logforth::filter::EnvFilter;
use logforth::{Layout, append};

/// Debug output for this crate, info for dependencies.
pub const DEFAULT_FILTER: &str = "netdiag=debug,info";

/// Colored level, module tag and message.
#[derive(Clone, Copy, Debug)]
struct ComponentLayout;

impl Layout for ComponentLayout {
    fn format(
        &self,
        record: &log::Record,
        _: &[Box<dyn logforth::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let colors = LevelColor::default();
        let level = colors.colorize_record_level(false, record.level());
        let message = record.args();
        let line = match component(record.target()) {
            Some(component) => format!("{level:>5} {component:<8} {message}"),
            None => format!("{level:>5} {message}"),
        };
        Ok(line.into_bytes())
    }
}

/// Top-level module of a target inside this crate.
fn component(target: &str) -> Option<&str> {
    target
        .strip_prefix("netdiag::")
        .and_then(|path| path.split("::").next())
}

/// Installs the compact stderr logger.
pub fn enable_logforth() {
    enable_logforth_append(append::Stderr::default().with_layout(ComponentLayout));
}

/// Installs a stderr logger with timestamps and full module paths.
pub fn enable_logforth_detailed() {
    enable_logforth_append(append::Stderr::default());
}

fn enable_logforth_append<A: logforth::Append>(to_append: A) {
    let filter = EnvFilter::from_default_env_or(DEFAULT_FILTER);
    logforth::builder()
        .dispatch(|d| d.filter(filter).append(to_append))
        .apply();
}
