//! Title transcoding with ffmpeg.

use std::path::Path;
use tokio::process::Command;

/// Build an ffmpeg command transcoding `source` into `target`
///
/// `codec_args` go between input and output (the configured
/// `transcode.ffmpeg_args`, x264 CRF 18 with all streams mapped by default).
pub fn build_ffmpeg_command(source: &Path, target: &Path, codec_args: &[String]) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-nostdin");
    cmd.arg("-hide_banner");
    cmd.arg("-i").arg(source);
    cmd.args(codec_args);
    // target lives in the job's WIP directory, owned by this task only
    cmd.arg("-y");
    cmd.arg(target);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{get_command_args, has_flag, has_flag_with_value};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_command_keeps_args_in_order(
            source in "[a-zA-Z0-9_/.-]{1,40}",
            crf in 0u32..51,
        ) {
            let codec_args: Vec<String> = vec![
                "-c:v".into(), "libx264".into(), "-crf".into(), crf.to_string(),
            ];
            let cmd = build_ffmpeg_command(Path::new(&source), Path::new("/wip/out.mp4"), &codec_args);
            let args = get_command_args(&cmd);

            prop_assert!(has_flag_with_value(&args, "-i", &source));
            prop_assert!(has_flag_with_value(&args, "-crf", &crf.to_string()));

            let input_pos = args.iter().position(|a| a == "-i").unwrap();
            let codec_pos = args.iter().position(|a| a == "-c:v").unwrap();
            prop_assert!(input_pos < codec_pos);
            prop_assert_eq!(args.last().map(String::as_str), Some("/wip/out.mp4"));
        }
    }

    #[test]
    fn test_ffmpeg_command_is_non_interactive() {
        let cmd = build_ffmpeg_command(Path::new("a.mkv"), Path::new("a.mp4"), &[]);
        let args = get_command_args(&cmd);
        assert!(has_flag(&args, "-nostdin"));
        assert!(has_flag(&args, "-y"));
    }
}
