//! A pure Rust implementation of the PureBasic debugger protocol, suitable
//! for building debug adapters on top of the stock compiler toolchain.
//!
//! The [session] module drives a full debug session (compile, launch,
//! breakpoints, stepping, variables, evaluation); the [protocol] and
//! [transport] modules expose the wire format and the debugger channels for
//! lower-level use.

#![warn(
    anonymous_parameters,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_qualifications,
    variant_size_differences
)]

use std::path::PathBuf;

pub mod launcher;
pub mod protocol;
pub mod session;
pub mod transport;

/// Attempts to locate the PureBasic compiler from the runtime environment,
/// checking the following locations in order:
///   - $PUREBASIC_HOME/compilers/pbcompiler
///   - every directory on $PATH
///
/// Returns None if no compiler executable can be found.
pub fn compiler_path_from_env() -> Option<PathBuf> {
    let binary = format!("pbcompiler{}", std::env::consts::EXE_SUFFIX);

    let paths = std::env::var("PUREBASIC_HOME")
        .ok()
        .map(|home| PathBuf::from(home).join("compilers").join(&binary))
        .into_iter()
        .chain(
            std::env::var_os("PATH")
                .map(|path| {
                    std::env::split_paths(&path)
                        .map(|dir| dir.join(&binary))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
        );

    paths.into_iter().find(|path| path.is_file())
}
