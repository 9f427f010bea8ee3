//! # Command Wrappers
//!
//! Installed packages export their executables through shell shims under
//! `/chef/bin`, and a profile fragment puts that directory on `PATH`.
//! Generation and removal are both idempotent: re-generating an existing
//! wrapper rewrites it, removing a missing one succeeds, so state
//! handlers replay cleanly after a crash.

use crate::constants::{CHEF_HOME, Paths};
use crate::error::{Error, Result};
use crate::install::app::{AppCommand, Application};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Generates the wrapper for one command; returns the wrapper path.
pub fn generate_wrapper(
    paths: &Paths,
    app: &Application,
    command: &AppCommand,
) -> Result<PathBuf> {
    let wrapper = paths.wrapper_path(&command.name);
    if let Some(parent) = wrapper.parent() {
        fs::create_dir_all(parent)?;
    }

    let target = paths
        .mount_point(&app.publisher, &app.package)
        .join(&command.path);
    let args = command
        .arguments
        .iter()
        .map(|a| format!(" \"{}\"", a))
        .collect::<String>();
    let body = format!(
        "#!/bin/sh\n# chef wrapper for {}\nexec \"{}\"{} \"$@\"\n",
        app.name(),
        target.display(),
        args
    );

    fs::write(&wrapper, body)?;
    set_executable(&wrapper)?;
    debug!("wrapper {} -> {}", wrapper.display(), target.display());
    Ok(wrapper)
}

/// Removes the wrapper for one command; missing wrappers succeed.
pub fn remove_wrapper(paths: &Paths, command: &AppCommand) -> Result<()> {
    let wrapper = paths.wrapper_path(&command.name);
    match fs::remove_file(&wrapper) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Writes the profile fragment exporting `CHEF_HOME` and extending
/// `PATH`. Rewriting an existing shim succeeds.
pub fn ensure_profile_shim(paths: &Paths) -> Result<()> {
    let shim = paths.profile_shim();
    if let Some(parent) = shim.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = format!(
        "export CHEF_HOME={}\nexport PATH=\"$CHEF_HOME/bin:$PATH\"\n",
        CHEF_HOME
    );
    fs::write(&shim, body).map_err(Error::Io)
}

#[cfg(unix)]
fn set_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(Error::Io)
}

#[cfg(not(unix))]
fn set_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::app::CommandKind;
    use tempfile::TempDir;

    fn sample_app() -> Application {
        Application {
            publisher: "acme".into(),
            package: "hello".into(),
            revision: 7,
            commands: vec![AppCommand {
                name: "hello".into(),
                kind: CommandKind::Executable,
                path: PathBuf::from("bin/hello"),
                arguments: vec!["--greeting".into()],
            }],
            mount: None,
            container: None,
        }
    }

    #[test]
    fn test_wrapper_resolves_to_mounted_command() {
        let temp = TempDir::new().unwrap();
        let paths = Paths::with_prefix(temp.path());
        let app = sample_app();

        let wrapper = generate_wrapper(&paths, &app, &app.commands[0]).unwrap();
        assert!(wrapper.ends_with("chef/bin/hello"));
        let body = fs::read_to_string(&wrapper).unwrap();
        assert!(body.contains("var/chef/mnt/acme-hello/bin/hello"));
        assert!(body.contains("--greeting"));

        // Regeneration succeeds on replay.
        generate_wrapper(&paths, &app, &app.commands[0]).unwrap();
    }

    #[test]
    fn test_remove_missing_wrapper_is_success() {
        let temp = TempDir::new().unwrap();
        let paths = Paths::with_prefix(temp.path());
        let app = sample_app();
        remove_wrapper(&paths, &app.commands[0]).unwrap();

        generate_wrapper(&paths, &app, &app.commands[0]).unwrap();
        remove_wrapper(&paths, &app.commands[0]).unwrap();
        remove_wrapper(&paths, &app.commands[0]).unwrap();
        assert!(!paths.wrapper_path("hello").exists());
    }

    #[test]
    fn test_profile_shim_exports_chef_home() {
        let temp = TempDir::new().unwrap();
        let paths = Paths::with_prefix(temp.path());
        ensure_profile_shim(&paths).unwrap();
        let body = fs::read_to_string(paths.profile_shim()).unwrap();
        assert!(body.contains("CHEF_HOME=/chef"));
        assert!(body.contains("$CHEF_HOME/bin:$PATH"));
        // Idempotent rewrite.
        ensure_profile_shim(&paths).unwrap();
    }
}
