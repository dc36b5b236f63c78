//! Artifact path resolution for one page.
//!
//! Every intermediate and final file a job produces is named here, once,
//! at job construction. Names are a pure function of the upscaled
//! source's file stem, the work directory, and the destination, so
//! re-resolving the same inputs always yields the same paths, and two
//! pages with different stems never share a scratch file.
//!
//! Scratch artifacts live in the work directory. Only presentable
//! outputs (the vector trace, its raster, and the restored page) are
//! written next to the destination.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::stage::Stage;
use crate::types::{InputKind, PipelineError};

/// Suffix appended to the upscaled source's stem for all scratch names.
const WORK_STEM_SUFFIX: &str = "-upscayled";

/// The full set of file paths used by one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    work_dir: PathBuf,
    out_dir: PathBuf,
    work_stem: String,
    scale: u32,
    artifacts_removed: PathBuf,
    colors_removed: PathBuf,
    smoothed: PathBuf,
    ink_trace_svg: PathBuf,
    ink_trace_png: PathBuf,
    inpainted: PathBuf,
    restored_upscayl: PathBuf,
    restored: PathBuf,
}

impl ArtifactPaths {
    /// Derive all artifact paths for an upscaled page.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidInput`] if `work_dir` or the
    /// destination's directory is not an existing directory, or if
    /// `upscayl_file` does not exist or has no file stem.
    pub fn resolve(
        work_dir: &Path,
        upscayl_file: &Path,
        dest_file: &Path,
        scale: u32,
    ) -> Result<Self, PipelineError> {
        if !work_dir.is_dir() {
            return Err(invalid(InputKind::WorkDir, work_dir));
        }
        let out_dir = match dest_file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !out_dir.is_dir() {
            return Err(invalid(InputKind::OutputDir, &out_dir));
        }
        if !upscayl_file.exists() {
            return Err(invalid(InputKind::UpscaylFile, upscayl_file));
        }
        let stem = upscayl_file
            .file_stem()
            .ok_or_else(|| invalid(InputKind::UpscaylFile, upscayl_file))?;

        Ok(Self::derive(
            work_dir,
            &out_dir,
            &stem.to_string_lossy(),
            dest_file,
            scale,
        ))
    }

    /// Pure path derivation; no filesystem access.
    fn derive(work_dir: &Path, out_dir: &Path, stem: &str, dest_file: &Path, scale: u32) -> Self {
        let work_stem = format!("{stem}{WORK_STEM_SUFFIX}");
        let work = |suffix: &str| work_dir.join(format!("{work_stem}-{suffix}.png"));
        let ink_trace_svg = dest_file.with_extension("svg");
        let ink_trace_png = append_extension(&ink_trace_svg, "png");

        Self {
            work_dir: work_dir.to_path_buf(),
            out_dir: out_dir.to_path_buf(),
            scale,
            artifacts_removed: work("median-filtered"),
            colors_removed: work("color-removed"),
            smoothed: work("color-removed-smoothed"),
            ink_trace_svg,
            ink_trace_png,
            inpainted: work("inpainted"),
            restored_upscayl: work("restored"),
            restored: dest_file.to_path_buf(),
            work_stem,
        }
    }

    /// The scratch directory.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The directory receiving presentable outputs.
    #[must_use]
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Prefix shared by every scratch file of this job.
    #[must_use]
    pub fn work_stem(&self) -> &str {
        &self.work_stem
    }

    /// Upscale factor the paths were derived for.
    #[must_use]
    pub const fn scale(&self) -> u32 {
        self.scale
    }

    /// Stage 1 output: artifact-filtered image.
    #[must_use]
    pub fn artifacts_removed(&self) -> &Path {
        &self.artifacts_removed
    }

    /// Stage 2 output: color-reduced image.
    #[must_use]
    pub fn colors_removed(&self) -> &Path {
        &self.colors_removed
    }

    /// Stage 3 output: smoothed color-reduced image.
    #[must_use]
    pub fn smoothed(&self) -> &Path {
        &self.smoothed
    }

    /// Stage 4 intermediate: black-ink vector trace.
    #[must_use]
    pub fn ink_trace_svg(&self) -> &Path {
        &self.ink_trace_svg
    }

    /// Stage 4 output: rasterized ink trace.
    #[must_use]
    pub fn ink_trace_png(&self) -> &Path {
        &self.ink_trace_png
    }

    /// Stage 5 output: inpainted upscaled image.
    #[must_use]
    pub fn inpainted(&self) -> &Path {
        &self.inpainted
    }

    /// Stage 6 output: restored page at upscaled size.
    #[must_use]
    pub fn restored_upscayl(&self) -> &Path {
        &self.restored_upscayl
    }

    /// Stage 7 output: the final destination.
    #[must_use]
    pub fn restored(&self) -> &Path {
        &self.restored
    }

    /// The primary output of `stage`, checked by the reporter.
    #[must_use]
    pub fn output(&self, stage: Stage) -> &Path {
        match stage {
            Stage::RemoveArtifacts => &self.artifacts_removed,
            Stage::ReduceColors => &self.colors_removed,
            Stage::Smooth => &self.smoothed,
            Stage::Vectorize => &self.ink_trace_png,
            Stage::Inpaint => &self.inpainted,
            Stage::Overlay => &self.restored_upscayl,
            Stage::Resize => &self.restored,
        }
    }

    /// A job-private scratch file, e.g. `scratch("remove-mask", "png")`.
    #[must_use]
    pub fn scratch(&self, suffix: &str, extension: &str) -> PathBuf {
        self.work_dir
            .join(format!("{}-{suffix}.{extension}", self.work_stem))
    }
}

fn invalid(kind: InputKind, path: &Path) -> PipelineError {
    PipelineError::InvalidInput {
        kind,
        path: path.to_path_buf(),
    }
}

/// `foo.svg` + `png` -> `foo.svg.png`.
fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(".");
    s.push(extension);
    PathBuf::from(s)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Fixture {
        _tmp: tempfile::TempDir,
        work: PathBuf,
        out: PathBuf,
        upscayl: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let out = tmp.path().join("out");
        std::fs::create_dir(&work).unwrap();
        std::fs::create_dir(&out).unwrap();
        let upscayl = tmp.path().join("page-07.png");
        std::fs::write(&upscayl, b"png").unwrap();
        Fixture {
            _tmp: tmp,
            work,
            out,
            upscayl,
        }
    }

    #[test]
    fn resolve_is_deterministic() {
        let f = fixture();
        let dest = f.out.join("07.png");
        let a = ArtifactPaths::resolve(&f.work, &f.upscayl, &dest, 4).unwrap();
        let b = ArtifactPaths::resolve(&f.work, &f.upscayl, &dest, 4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn scratch_names_use_upscayled_stem() {
        let f = fixture();
        let dest = f.out.join("07.png");
        let paths = ArtifactPaths::resolve(&f.work, &f.upscayl, &dest, 4).unwrap();
        assert_eq!(paths.work_stem(), "page-07-upscayled");
        assert_eq!(
            paths.artifacts_removed(),
            f.work.join("page-07-upscayled-median-filtered.png")
        );
        assert_eq!(
            paths.colors_removed(),
            f.work.join("page-07-upscayled-color-removed.png")
        );
        assert_eq!(
            paths.smoothed(),
            f.work.join("page-07-upscayled-color-removed-smoothed.png")
        );
        assert_eq!(
            paths.inpainted(),
            f.work.join("page-07-upscayled-inpainted.png")
        );
        assert_eq!(
            paths.restored_upscayl(),
            f.work.join("page-07-upscayled-restored.png")
        );
    }

    #[test]
    fn presentable_outputs_live_next_to_destination() {
        let f = fixture();
        let dest = f.out.join("07.jpg");
        let paths = ArtifactPaths::resolve(&f.work, &f.upscayl, &dest, 4).unwrap();
        assert_eq!(paths.ink_trace_svg(), f.out.join("07.svg"));
        assert_eq!(paths.ink_trace_png(), f.out.join("07.svg.png"));
        assert_eq!(paths.restored(), dest);
        assert_eq!(paths.out_dir(), f.out);
    }

    #[test]
    fn every_stage_output_is_distinct() {
        let f = fixture();
        let dest = f.out.join("07.png");
        let paths = ArtifactPaths::resolve(&f.work, &f.upscayl, &dest, 4).unwrap();
        let mut outputs: Vec<&Path> = Stage::ALL.iter().map(|&s| paths.output(s)).collect();
        outputs.sort();
        outputs.dedup();
        assert_eq!(outputs.len(), Stage::ALL.len());
    }

    #[test]
    fn different_pages_never_share_scratch_files() {
        let f = fixture();
        let other = f.upscayl.with_file_name("page-08.png");
        std::fs::write(&other, b"png").unwrap();
        let a = ArtifactPaths::resolve(&f.work, &f.upscayl, &f.out.join("07.png"), 4).unwrap();
        let b = ArtifactPaths::resolve(&f.work, &other, &f.out.join("08.png"), 4).unwrap();
        for stage in Stage::ALL {
            assert_ne!(a.output(stage), b.output(stage));
        }
        assert_ne!(a.scratch("mask", "png"), b.scratch("mask", "png"));
    }

    #[test]
    fn scratch_is_prefixed_by_work_stem() {
        let f = fixture();
        let paths = ArtifactPaths::resolve(&f.work, &f.upscayl, &f.out.join("07.png"), 4).unwrap();
        assert_eq!(
            paths.scratch("remove-mask", "png"),
            f.work.join("page-07-upscayled-remove-mask.png")
        );
    }

    #[test]
    fn missing_work_dir_is_invalid_input() {
        let f = fixture();
        let result =
            ArtifactPaths::resolve(&f.work.join("nope"), &f.upscayl, &f.out.join("07.png"), 4);
        assert!(matches!(
            result,
            Err(PipelineError::InvalidInput {
                kind: InputKind::WorkDir,
                ..
            })
        ));
    }

    #[test]
    fn missing_output_dir_is_invalid_input() {
        let f = fixture();
        let result =
            ArtifactPaths::resolve(&f.work, &f.upscayl, &f.out.join("nope").join("07.png"), 4);
        assert!(matches!(
            result,
            Err(PipelineError::InvalidInput {
                kind: InputKind::OutputDir,
                ..
            })
        ));
    }

    #[test]
    fn missing_upscayl_file_is_invalid_input() {
        let f = fixture();
        let result = ArtifactPaths::resolve(
            &f.work,
            &f.upscayl.with_file_name("missing.png"),
            &f.out.join("07.png"),
            4,
        );
        assert!(matches!(
            result,
            Err(PipelineError::InvalidInput {
                kind: InputKind::UpscaylFile,
                ..
            })
        ));
    }
}
