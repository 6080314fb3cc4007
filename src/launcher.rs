//! Spawns the PureBasic compiler and the compiled debuggee.
//!
//! The compiler is invoked with debug information and line numbering
//! enabled, writing to a unique temp path. The debuggee finds the adapter
//! through two environment variables injected at spawn: the communication
//! string naming the channel and an options string with the debugger flags.

use std::{
    env, fs,
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use thiserror::Error;

use crate::transport::random_token;

/// Environment variable naming the debugger channel.
pub const COMMUNICATION_ENV: &str = "PB_DEBUGGER_Communication";
/// Environment variable carrying the debugger option flags.
pub const OPTIONS_ENV: &str = "PB_DEBUGGER_Options";

const PUREBASIC_HOME: &str = "PUREBASIC_HOME";

/// An error spawning the compiler or the debuggee.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The compiler exited non-zero or produced no executable.
    #[error("compilation failed: {message}")]
    Compile {
        /// Compiler diagnostics; sanitised unless tracing is enabled.
        message: String,
    },
    /// A process could not be spawned.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Flags passed to the debuggee in [OPTIONS_ENV], each rendered as `0` or
/// `1` and joined by `;`.
#[derive(Debug, Clone, Copy)]
pub struct DebuggerOptions {
    /// Debuggee strings are UTF-16.
    pub unicode: bool,
    /// Stop in the debugger as soon as the program starts.
    pub call_on_start: bool,
    /// Stop in the debugger just before the program ends.
    pub call_on_end: bool,
    /// Wire integers are big-endian. Never set by this adapter.
    pub big_endian: bool,
}

impl Default for DebuggerOptions {
    fn default() -> Self {
        Self {
            unicode: true,
            call_on_start: false,
            call_on_end: false,
            big_endian: false,
        }
    }
}

impl DebuggerOptions {
    /// Renders the options in the environment format, e.g. `1;1;0;0`.
    pub fn to_env_string(&self) -> String {
        [
            self.unicode,
            self.call_on_start,
            self.call_on_end,
            self.big_endian,
        ]
        .map(|flag| if flag { "1" } else { "0" })
        .join(";")
    }
}

/// Compiles `source` with debug info and line numbering, returning the path
/// of the produced executable.
pub fn compile(source: &Path, compiler: &Path, trace: bool) -> Result<PathBuf, LaunchError> {
    let output_path = env::temp_dir().join(format!(
        "pbdebug_{}{}",
        random_token(),
        env::consts::EXE_SUFFIX
    ));

    let mut command = Command::new(compiler);
    if cfg!(windows) {
        command
            .arg("/DEBUGGER")
            .arg("/LINENUMBERING")
            .arg("/EXE")
            .arg(&output_path);
    } else {
        command
            .arg("--debugger")
            .arg("--linenumbering")
            .arg("--executable")
            .arg(&output_path);
    }
    command.arg(source);

    if env::var_os(PUREBASIC_HOME).is_none() {
        if let Some(home) = infer_home(compiler) {
            log::debug!("inferred {PUREBASIC_HOME}={}", home.display());
            command.env(PUREBASIC_HOME, home);
        }
    }

    log::debug!("compiling {} with {}", source.display(), compiler.display());
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() || !output_path.exists() {
        let _ = fs::remove_file(&output_path);

        let message = if trace {
            format!("{}\n{}", stdout.trim_end(), stderr.trim_end())
                .trim()
                .to_string()
        } else {
            // Keep local filesystem details out of the message.
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "source".to_string());
            format!("the compiler reported errors in {name}")
        };

        return Err(LaunchError::Compile { message });
    }

    log::debug!("compiled to {}", output_path.display());
    Ok(output_path)
}

/// Spawns the compiled debuggee with the channel and option environment
/// injected. Output streams are discarded; program output travels over the
/// debugger channel.
pub fn launch(
    executable: &Path,
    communication: &str,
    options: &DebuggerOptions,
) -> io::Result<Child> {
    log::debug!(
        "launching {} with {COMMUNICATION_ENV}={communication}",
        executable.display()
    );

    let mut command = Command::new(executable);
    if let Some(dir) = executable.parent() {
        command.current_dir(dir);
    }

    command
        .env(COMMUNICATION_ENV, communication)
        .env(OPTIONS_ENV, options.to_env_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}

// The compiler normally lives at <home>/compilers/pbcompiler; on macOS it
// hides inside the application bundle under Contents/Resources.
fn infer_home(compiler: &Path) -> Option<PathBuf> {
    let parent = compiler.parent()?;
    if parent.file_name().is_some_and(|n| n == "compilers") {
        return parent.parent().map(Path::to_path_buf);
    }

    for ancestor in compiler.ancestors() {
        let is_bundle = ancestor
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("app"));
        if is_bundle {
            return Some(ancestor.join("Contents").join("Resources"));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn options_env_string() {
        let options = DebuggerOptions {
            unicode: true,
            call_on_start: true,
            call_on_end: false,
            big_endian: false,
        };
        assert_eq!(options.to_env_string(), "1;1;0;0");

        assert_eq!(DebuggerOptions::default().to_env_string(), "1;0;0;0");
    }

    #[test]
    fn home_inference() {
        assert_eq!(
            infer_home(Path::new("/opt/purebasic/compilers/pbcompiler")),
            Some(PathBuf::from("/opt/purebasic"))
        );

        assert_eq!(
            infer_home(Path::new(
                "/Applications/PureBasic.app/Contents/Resources/compilers/pbcompiler"
            )),
            Some(PathBuf::from(
                "/Applications/PureBasic.app/Contents/Resources"
            ))
        );

        assert_eq!(infer_home(Path::new("/usr/bin/pbcompiler")), None);
    }

    #[cfg(unix)]
    #[test]
    fn compile_captures_failure() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("pbcompiler");
        fs::write(&fake, "#!/bin/sh\necho 'Syntax error on line 3' >&2\nexit 1\n").unwrap();
        fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();

        let source = dir.path().join("broken.pb");
        fs::write(&source, "Debug \"x\"\n").unwrap();

        let err = compile(&source, &fake, true).unwrap_err();
        match err {
            LaunchError::Compile { message } => assert!(message.contains("Syntax error")),
            other => panic!("unexpected error: {other}"),
        }

        // Without tracing, the message carries the file name only.
        let err = compile(&source, &fake, false).unwrap_err();
        match err {
            LaunchError::Compile { message } => {
                assert!(message.contains("broken.pb"));
                assert!(!message.contains("Syntax error"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn compile_produces_an_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("pbcompiler");
        // A stand-in that copies the source to wherever --executable says.
        fs::write(
            &fake,
            "#!/bin/sh\nwhile [ $# -gt 1 ]; do\n  if [ \"$1\" = \"--executable\" ]; then out=\"$2\"; fi\n  shift\ndone\ncp \"$1\" \"$out\"\n",
        )
        .unwrap();
        fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();

        let source = dir.path().join("ok.pb");
        fs::write(&source, "Debug \"hello\"\n").unwrap();

        let out = compile(&source, &fake, false).unwrap();
        assert!(out.exists());
        fs::remove_file(out).unwrap();
    }
}
