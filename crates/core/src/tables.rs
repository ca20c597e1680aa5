//! Adapter for the external table-boundary detector. The detector runs as a
//! separate program, writes `tables.json` plus debug images into an output
//! directory, and never feeds the text index.

use crate::traits::TableDetector;
use crate::TableDetectionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

pub const REPORT_FILE: &str = "tables.json";
pub const OVERLAY_FILE: &str = "07_overlay.png";

/// Pixel box of one detected table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Contour area, which can be smaller than `w * h`.
    pub area: f64,
    pub aspect: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDetection {
    pub image: PathBuf,
    /// Largest first.
    pub tables: Vec<BoundingBox>,
    pub debug_overlay: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDetectionOptions {
    /// Adaptive threshold window; must be odd.
    pub block_size: u32,
    pub c_value: i32,
    pub kernel_scale: u32,
    pub dilate_iterations: u32,
    /// Minimum table area as a fraction of the image area.
    pub min_area_ratio: f64,
    pub min_width: u32,
    pub min_height: u32,
    pub min_aspect: f64,
    pub max_aspect: f64,
}

impl Default for TableDetectionOptions {
    fn default() -> Self {
        Self {
            block_size: 25,
            c_value: 15,
            kernel_scale: 30,
            dilate_iterations: 2,
            min_area_ratio: 0.01,
            min_width: 120,
            min_height: 80,
            min_aspect: 0.3,
            max_aspect: 6.0,
        }
    }
}

impl TableDetectionOptions {
    pub fn validate(&self) -> Result<(), TableDetectionError> {
        if self.block_size < 3 || self.block_size % 2 == 0 {
            return Err(TableDetectionError::InvalidOptions(format!(
                "block size must be an odd number of at least 3, got {}",
                self.block_size
            )));
        }
        if self.kernel_scale == 0 {
            return Err(TableDetectionError::InvalidOptions(
                "kernel scale must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_area_ratio) {
            return Err(TableDetectionError::InvalidOptions(format!(
                "min area ratio must be within 0..=1, got {}",
                self.min_area_ratio
            )));
        }
        if self.min_aspect <= 0.0 || self.min_aspect > self.max_aspect {
            return Err(TableDetectionError::InvalidOptions(format!(
                "aspect range {}..{} is empty",
                self.min_aspect, self.max_aspect
            )));
        }
        Ok(())
    }

    fn to_args(&self) -> Vec<String> {
        vec![
            "--block-size".to_string(),
            self.block_size.to_string(),
            "--c-value".to_string(),
            self.c_value.to_string(),
            "--kernel-scale".to_string(),
            self.kernel_scale.to_string(),
            "--dilate-iters".to_string(),
            self.dilate_iterations.to_string(),
            "--min-area-ratio".to_string(),
            self.min_area_ratio.to_string(),
            "--min-width".to_string(),
            self.min_width.to_string(),
            "--min-height".to_string(),
            self.min_height.to_string(),
            "--min-aspect".to_string(),
            self.min_aspect.to_string(),
            "--max-aspect".to_string(),
            self.max_aspect.to_string(),
        ]
    }
}

#[derive(Deserialize)]
struct DetectionReport {
    image: PathBuf,
    #[serde(default)]
    tables: Vec<BoundingBox>,
}

/// Parse a `tables.json` report. Boxes come back largest first.
pub fn parse_detection_report(json: &str) -> Result<TableDetection, TableDetectionError> {
    let report: DetectionReport = serde_json::from_str(json)?;
    let mut tables = report.tables;
    tables.sort_by(|left, right| right.area.total_cmp(&left.area));

    Ok(TableDetection {
        image: report.image,
        tables,
        debug_overlay: None,
    })
}

/// Runs `program base_args.. --image <path> --out-dir <dir> <options>`.
#[derive(Debug, Clone)]
pub struct CommandTableDetector {
    program: String,
    base_args: Vec<String>,
    out_dir: PathBuf,
    options: TableDetectionOptions,
}

impl CommandTableDetector {
    pub fn new(program: impl Into<String>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            out_dir: out_dir.into(),
            options: TableDetectionOptions::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_options(mut self, options: TableDetectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }
}

#[async_trait]
impl TableDetector for CommandTableDetector {
    async fn detect(&self, image: &Path) -> Result<TableDetection, TableDetectionError> {
        self.options.validate()?;
        if !image.is_file() {
            return Err(TableDetectionError::ImageNotFound(image.to_path_buf()));
        }
        tokio::fs::create_dir_all(&self.out_dir).await?;

        debug!(program = %self.program, image = %image.display(), "running table detector");
        let output = Command::new(&self.program)
            .args(&self.base_args)
            .arg("--image")
            .arg(image)
            .arg("--out-dir")
            .arg(&self.out_dir)
            .args(self.options.to_args())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(TableDetectionError::DetectorFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let report = tokio::fs::read_to_string(self.out_dir.join(REPORT_FILE)).await?;
        let mut detection = parse_detection_report(&report)?;
        let overlay = self.out_dir.join(OVERLAY_FILE);
        if overlay.is_file() {
            detection.debug_overlay = Some(overlay);
        }

        info!(image = %image.display(), tables = detection.tables.len(), "table detection complete");
        Ok(detection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const REPORT: &str = r#"{
      "image": "data/invoice.png",
      "tables": [
        {"x": 10, "y": 20, "w": 300, "h": 100, "area": 28000.0, "aspect": 3.0},
        {"x": 40, "y": 400, "w": 500, "h": 200, "area": 97000.5, "aspect": 2.5}
      ]
    }"#;

    #[test]
    fn reports_are_sorted_largest_first() -> Result<(), TableDetectionError> {
        let detection = parse_detection_report(REPORT)?;
        assert_eq!(detection.image, PathBuf::from("data/invoice.png"));
        assert_eq!(detection.tables.len(), 2);
        assert_eq!(detection.tables[0].w, 500);
        assert_eq!(detection.tables[1].area, 28000.0);
        Ok(())
    }

    #[test]
    fn malformed_reports_are_errors() {
        let result = parse_detection_report("{\"tables\": 3}");
        assert!(matches!(result, Err(TableDetectionError::InvalidReport(_))));
    }

    #[test]
    fn even_block_sizes_are_rejected() {
        let options = TableDetectionOptions {
            block_size: 24,
            ..TableDetectionOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(TableDetectionError::InvalidOptions(_))
        ));
        assert!(TableDetectionOptions::default().validate().is_ok());
    }

    #[test]
    fn options_render_as_detector_flags() {
        let args = TableDetectionOptions::default().to_args();
        let pairs = args.chunks(2).map(|pair| (pair[0].as_str(), pair[1].as_str())).collect::<Vec<_>>();
        assert!(pairs.contains(&("--block-size", "25")));
        assert!(pairs.contains(&("--dilate-iters", "2")));
        assert!(pairs.contains(&("--min-area-ratio", "0.01")));
        assert!(pairs.contains(&("--max-aspect", "6")));
    }

    #[tokio::test]
    async fn missing_images_are_reported_before_running() {
        let dir = tempdir().unwrap();
        let detector = CommandTableDetector::new("does-not-exist", dir.path());
        let result = detector.detect(&dir.path().join("missing.png")).await;
        assert!(matches!(result, Err(TableDetectionError::ImageNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detector_output_is_collected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let image = dir.path().join("scan.png");
        std::fs::write(&image, [0u8; 4])?;
        let out_dir = dir.path().join("out");

        let script = format!(
            r#"out=""; while [ $# -gt 0 ]; do if [ "$1" = "--out-dir" ]; then out="$2"; fi; shift; done; printf '%s' '{}' > "$out/tables.json"; : > "$out/07_overlay.png""#,
            REPORT.replace('\n', " ")
        );
        let detector = CommandTableDetector::new("sh", &out_dir).with_args(["-c", script.as_str(), "detector"]);

        let detection = detector.detect(&image).await?;
        assert_eq!(detection.tables.len(), 2);
        assert_eq!(detection.tables[0].area, 97000.5);
        assert_eq!(detection.debug_overlay, Some(out_dir.join(OVERLAY_FILE)));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_detectors_surface_stderr() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let image = dir.path().join("scan.png");
        std::fs::write(&image, [0u8; 4])?;

        let detector = CommandTableDetector::new("sh", dir.path().join("out"))
            .with_args(["-c", "echo 'cannot read image' >&2; exit 3", "detector"]);
        match detector.detect(&image).await {
            Err(TableDetectionError::DetectorFailed { stderr, .. }) => {
                assert_eq!(stderr, "cannot read image");
            }
            other => panic!("unexpected result {other:?}"),
        }
        Ok(())
    }
}
