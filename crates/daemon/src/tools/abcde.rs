//! Audio CD ripping with abcde (track splitting, metadata lookup, FLAC encoding).

use std::path::Path;
use tokio::process::Command;

/// Build an abcde command ripping `device` into `workdir`
///
/// abcde writes the album directory into its working directory:
/// - `-o flac` encode to FLAC
/// - `-B` embed album art when available
/// - `-N` non-interactive
pub fn build_abcde_command(device: &Path, workdir: &Path) -> Command {
    let mut cmd = Command::new("abcde");
    cmd.arg("-d").arg(device);
    cmd.arg("-o").arg("flac");
    cmd.arg("-B");
    cmd.arg("-N");
    cmd.current_dir(workdir);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{get_command_args, has_flag, has_flag_with_value};

    #[test]
    fn test_abcde_command() {
        let cmd = build_abcde_command(Path::new("/dev/sr0"), Path::new("/wip/redbook-1/rip"));
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-d", "/dev/sr0"));
        assert!(has_flag_with_value(&args, "-o", "flac"));
        assert!(has_flag(&args, "-B"));
        assert!(has_flag(&args, "-N"));
        assert_eq!(
            cmd.as_std().get_current_dir(),
            Some(Path::new("/wip/redbook-1/rip"))
        );
    }
}
