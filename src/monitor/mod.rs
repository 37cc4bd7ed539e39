//! Host and process telemetry for `manage.monitor` replies.
//!
//! Collection shells out to the same tools an operator would use, so it is
//! slow (the Linux cpu numbers are sampled a second apart) and always runs
//! on a throwaway thread. Results land in the reply message under
//! `monitor.os.*` and `monitor.process.*`; a failed probe reports
//! `valid = false` with an `errorMessage` instead of partial numbers.

mod os;
mod process;

use std::process::Command;

use crate::message::Message;

/// Fill `monitor.os.*` in the reply.
pub fn fill_os(message: &mut Message) {
    os::collect().fill(message);
}

/// Fill `monitor.process.*` in the reply.
pub fn fill_process(message: &mut Message) {
    process::collect().fill(message);
}

// Run a shell command and capture stdout, None on spawn failure or
// non-zero exit.
pub(crate) fn run_command(command: &str) -> Option<String> {
    let output = Command::new("sh").arg("-c").arg(command).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}
