//! Whole-device image extraction with dd.

use std::path::Path;
use tokio::process::Command;

/// Block size matching the 2048-byte sectors of data discs
const DD_BLOCK_SIZE: &str = "bs=2048";

/// Build a dd command copying `device` into `target`
pub fn build_dd_command(device: &Path, target: &Path) -> Command {
    let mut cmd = Command::new("dd");

    let mut input = std::ffi::OsString::from("if=");
    input.push(device);
    let mut output = std::ffi::OsString::from("of=");
    output.push(target);

    cmd.arg(input);
    cmd.arg(output);
    cmd.arg(DD_BLOCK_SIZE);
    cmd.arg("status=progress");

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::get_command_args;
    use std::ffi::OsStr;

    #[test]
    fn test_dd_command() {
        let cmd = build_dd_command(Path::new("/dev/sr0"), Path::new("/wip/iso-1/BACKUP01.iso"));
        let args = get_command_args(&cmd);

        assert_eq!(cmd.as_std().get_program(), OsStr::new("dd"));
        assert_eq!(
            args,
            vec!["if=/dev/sr0", "of=/wip/iso-1/BACKUP01.iso", "bs=2048", "status=progress"]
        );
    }
}
