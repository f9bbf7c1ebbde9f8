use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use tracing::debug;

use lxdev_core::System;

const SUDOERS_FILE: &str = "/etc/sudoers.d/lxdev";
// sudo skips files in sudoers.d whose name contains a dot.
const STAGING_FILE: &str = "/etc/sudoers.d/lxdev.new";
const CONFIRMATION: &str = "yesplease";
const PASSWORDLESS: &[&str] = &["lxc", "redir", "kill"];

/// Render the drop-in that lets `user` run each of `programs` (absolute
/// paths) through sudo without a password.
pub(crate) fn render(user: &str, programs: &[String]) -> String {
    let mut out = String::from("# Created by lxdev\n");
    for program in programs {
        out.push_str(&format!("{} ALL=(root) NOPASSWD: {}\n", user, program));
    }
    out
}

/// Absolute path of `program`. Shell builtins such as `kill` resolve to a
/// bare name under `command -v`, so `which` is asked next.
fn resolve_program(system: &System, program: &str) -> Result<String> {
    for lookup in ["command -v", "which"] {
        let found = system.host(&format!("{} {}", lookup, program))?;
        let path = found.text();
        if found.success() && path.starts_with('/') {
            return Ok(path.to_string());
        }
    }
    bail!("{} not found as an executable in PATH", program)
}

/// Check `content` with visudo, then move it into place in one step.
fn install(system: &System, content: &str) -> Result<()> {
    system
        .check(
            "sudoers rules were rejected",
            &format!("visudo -cf - <<'EOS'\n{}EOS", content),
        )
        .context("visudo rejected the generated rules; nothing was written")?;

    debug!(file = SUDOERS_FILE, "writing sudoers drop-in");
    system
        .check(
            "failed to write sudoers file",
            &format!("tee {} > /dev/null <<'EOS'\n{}EOS", STAGING_FILE, content),
        )
        .with_context(|| format!("could not write {}", STAGING_FILE))?;
    system.check(
        "failed to set sudoers file mode",
        &format!("chmod 0440 {}", STAGING_FILE),
    )?;
    system.check(
        "failed to install sudoers file",
        &format!("mv -f {} {}", STAGING_FILE, SUDOERS_FILE),
    )?;
    Ok(())
}

pub(crate) fn create(system: &System, input: &mut dyn BufRead) -> Result<()> {
    eprintln!(
        "lxdev: this writes {} so that lxdev can run {} as root without asking for a password.",
        SUDOERS_FILE,
        PASSWORDLESS.join(", ")
    );
    eprint!("lxdev: type '{}' to continue: ", CONFIRMATION);
    io::stderr().flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    if answer.trim() != CONFIRMATION {
        eprintln!("lxdev: not writing {}", SUDOERS_FILE);
        return Ok(());
    }

    let user = system.host("whoami")?.text().to_string();
    if user.is_empty() {
        bail!("could not determine the current user");
    }

    let programs = PASSWORDLESS
        .iter()
        .map(|program| resolve_program(system, program))
        .collect::<Result<Vec<_>>>()?;

    install(system, &render(&user, &programs))?;
    eprintln!("lxdev: wrote {}", SUDOERS_FILE);
    Ok(())
}
