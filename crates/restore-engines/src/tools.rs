//! Native tool invocations: G'MIC for smoothing, inpainting, and
//! overlay; vtracer for vectorizing; resvg for rasterizing the trace.
//!
//! Each function only builds the [`ToolCommand`]; the caller decides
//! the timeout and runs it.

use std::path::Path;

use restore_pipeline::ToolCommand;

use crate::config::{EngineConfig, SmoothParams, TraceParams};

/// G'MIC `fx_inpaint_matchpatch` arguments: patch size 5, lookup size
/// 26, lookup factor 5, blend size 1, mask color pure red.
const INPAINT_MATCHPATCH_ARGS: &str = "1,5,26,5,1,255,0,0,255,1,0";

/// Base G'MIC command with verbose progress on stdout.
fn gmic(config: &EngineConfig) -> ToolCommand {
    ToolCommand::new(&config.gmic).args(["-v", "+1"])
}

/// Stage 3: anisotropic smoothing, then threshold and normalize.
#[must_use]
pub fn smooth(config: &EngineConfig, input: &Path, output: &Path) -> ToolCommand {
    let params: &SmoothParams = &config.smooth;
    gmic(config)
        .arg(input)
        .arg("fx_smooth_anisotropic")
        .arg(params.to_gmic_arg())
        .arg("-threshold[-1]")
        .arg(format!("{},1", params.threshold))
        .args(["normalize[-1]", "0,255", "-output[-1]"])
        .arg(output)
}

/// Stage 4a: binary spline trace of the smoothed ink.
#[must_use]
pub fn vectorize(config: &EngineConfig, input: &Path, svg: &Path) -> ToolCommand {
    let t: &TraceParams = &config.trace;
    ToolCommand::new(&config.vtracer)
        .arg("--input")
        .arg(input)
        .arg("--output")
        .arg(svg)
        .args(["--colormode", "bw", "--mode", "spline"])
        .arg("--filter_speckle")
        .arg(t.filter_speckle.to_string())
        .arg("--corner_threshold")
        .arg(t.corner_threshold.to_string())
        .arg("--segment_length")
        .arg(t.segment_length.to_string())
        .arg("--splice_threshold")
        .arg(t.splice_threshold.to_string())
        .arg("--path_precision")
        .arg(t.path_precision.to_string())
}

/// Stage 4b: rasterize the trace at its native size.
#[must_use]
pub fn rasterize(config: &EngineConfig, svg: &Path, png: &Path) -> ToolCommand {
    ToolCommand::new(&config.resvg).arg(svg).arg(png)
}

/// Stage 5: patch-match inpaint of every pure red pixel.
#[must_use]
pub fn inpaint(config: &EngineConfig, input: &Path, output: &Path) -> ToolCommand {
    gmic(config)
        .arg(input)
        .args(["-fx_inpaint_matchpatch", INPAINT_MATCHPATCH_ARGS, "output"])
        .arg(output)
}

/// Stage 6: blend the ink trace over the inpainted page using the
/// trace's alpha.
#[must_use]
pub fn overlay(config: &EngineConfig, inpainted: &Path, ink: &Path, output: &Path) -> ToolCommand {
    gmic(config)
        .arg(inpainted)
        .arg(ink)
        .args([
            "+channels[-1]",
            "100%",
            "+image[0]",
            "[1],0%,0%,0,0,1,[2],255",
            "output[-1]",
        ])
        .arg(output)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::ffi::OsString;
    use std::path::PathBuf;

    use super::*;

    fn strings(cmd: &ToolCommand) -> Vec<String> {
        cmd.get_args()
            .iter()
            .map(|a: &OsString| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn smooth_command_line() {
        let cmd = smooth(
            &EngineConfig::default(),
            &PathBuf::from("in.png"),
            &PathBuf::from("out.png"),
        );
        assert_eq!(cmd.program(), "gmic");
        assert_eq!(
            strings(&cmd),
            [
                "-v",
                "+1",
                "in.png",
                "fx_smooth_anisotropic",
                "420,0.5,0.6,2.5,5,0.8,30,2,0,1,2,0",
                "-threshold[-1]",
                "100,1",
                "normalize[-1]",
                "0,255",
                "-output[-1]",
                "out.png",
            ]
        );
    }

    #[test]
    fn inpaint_targets_red_mask() {
        let cmd = inpaint(
            &EngineConfig::default(),
            &PathBuf::from("black-removed.png"),
            &PathBuf::from("inpainted.png"),
        );
        let args = strings(&cmd);
        assert_eq!(&args[..3], ["-v", "+1", "black-removed.png"]);
        assert!(args.contains(&"1,5,26,5,1,255,0,0,255,1,0".to_string()));
        assert_eq!(args.last().unwrap(), "inpainted.png");
    }

    #[test]
    fn overlay_reads_both_inputs_in_order() {
        let cmd = overlay(
            &EngineConfig::default(),
            &PathBuf::from("inpainted.png"),
            &PathBuf::from("ink.svg.png"),
            &PathBuf::from("restored.png"),
        );
        let args = strings(&cmd);
        assert_eq!(args[2], "inpainted.png");
        assert_eq!(args[3], "ink.svg.png");
        assert_eq!(args[7], "[1],0%,0%,0,0,1,[2],255");
        assert_eq!(args.last().unwrap(), "restored.png");
    }

    #[test]
    fn vectorize_uses_configured_program_and_params() {
        let config = EngineConfig {
            vtracer: "/opt/vtracer".to_string(),
            ..EngineConfig::default()
        };
        let cmd = vectorize(&config, &PathBuf::from("s.png"), &PathBuf::from("p.svg"));
        assert_eq!(cmd.program(), "/opt/vtracer");
        let args = strings(&cmd);
        let value_of = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].clone()
        };
        assert_eq!(value_of("--input"), "s.png");
        assert_eq!(value_of("--output"), "p.svg");
        assert_eq!(value_of("--colormode"), "bw");
        assert_eq!(value_of("--filter_speckle"), "2");
        assert_eq!(value_of("--segment_length"), "24");
    }

    #[test]
    fn rasterize_is_input_then_output() {
        let cmd = rasterize(
            &EngineConfig::default(),
            &PathBuf::from("p.svg"),
            &PathBuf::from("p.svg.png"),
        );
        assert_eq!(cmd.program(), "resvg");
        assert_eq!(strings(&cmd), ["p.svg", "p.svg.png"]);
    }
}
