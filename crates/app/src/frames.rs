//! Discovery of rendered frame sequences on disk.
//!
//! A capture directory holds `COLOR.<n>.png`, `DEPTH.<n>.exr` and
//! `MOTIONVECTORS.<n>.exr` files sharing a frame index `n`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Color,
    Depth,
    Motion,
}

pub struct FilenameParser {
    color: Regex,
    depth: Regex,
    motion: Regex,
}

impl FilenameParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            color: Regex::new(r"^COLOR\.([0-9]+)\.png$").context("invalid color pattern")?,
            depth: Regex::new(r"^DEPTH\.([0-9]+)\.exr$").context("invalid depth pattern")?,
            motion: Regex::new(r"^MOTIONVECTORS\.([0-9]+)\.exr$")
                .context("invalid motion pattern")?,
        })
    }

    pub fn parse(&self, filename: &str) -> Option<(FrameKind, u64)> {
        [
            (FrameKind::Color, &self.color),
            (FrameKind::Depth, &self.depth),
            (FrameKind::Motion, &self.motion),
        ]
        .into_iter()
        .find_map(|(kind, pattern)| {
            let index = pattern.captures(filename)?.get(1)?.as_str().parse().ok()?;
            Some((kind, index))
        })
    }
}

/// Frame files of one capture directory, keyed by frame index.
#[derive(Debug, Default)]
pub struct FrameSet {
    pub color: BTreeMap<u64, PathBuf>,
    pub depth: BTreeMap<u64, PathBuf>,
    pub motion: BTreeMap<u64, PathBuf>,
}

impl FrameSet {
    pub fn discover(dir: &Path) -> Result<Self> {
        let parser = FilenameParser::new()?;
        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to list input directory: {}", dir.display()))?;

        let mut set = Self::default();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to read entry in {}", dir.display()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((kind, index)) = parser.parse(name) {
                set.insert(kind, index, path);
            }
        }
        Ok(set)
    }

    pub fn insert(&mut self, kind: FrameKind, index: u64, path: PathBuf) {
        let map = match kind {
            FrameKind::Color => &mut self.color,
            FrameKind::Depth => &mut self.depth,
            FrameKind::Motion => &mut self.motion,
        };
        map.insert(index, path);
    }

    fn complete(&self, index: u64) -> Option<FrameFiles> {
        Some(FrameFiles {
            index,
            color: self.color.get(&index)?.clone(),
            depth: self.depth.get(&index)?.clone(),
            motion: self.motion.get(&index)?.clone(),
        })
    }

    /// Windows of `frame_count` consecutive complete frames, one per color
    /// frame that has enough history, in ascending index order.
    pub fn upscale_windows(&self, frame_count: usize) -> Vec<FrameWindow> {
        let preceding = frame_count.saturating_sub(1) as u64;
        self.color
            .keys()
            .filter_map(|&index| {
                let first = index.checked_sub(preceding)?;
                let frames = (first..=index)
                    .map(|i| self.complete(i))
                    .collect::<Option<Vec<_>>>()?;
                Some(FrameWindow { index, frames })
            })
            .collect()
    }

    /// Motion fields following `index` within a window, skipping gaps.
    pub fn following_motion(&self, index: u64, frame_count: usize) -> Vec<PathBuf> {
        (1..frame_count as u64)
            .filter_map(|offset| self.motion.get(&(index + offset)).cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFiles {
    pub index: u64,
    pub color: PathBuf,
    pub depth: PathBuf,
    pub motion: PathBuf,
}

/// The frames needed to produce the output for `index`, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameWindow {
    pub index: u64,
    pub frames: Vec<FrameFiles>,
}

impl FrameWindow {
    /// Frames that still have to be fed when the pipeline history already
    /// ends at `last_fed`.
    pub fn pending(&self, last_fed: Option<u64>) -> &[FrameFiles] {
        match (last_fed, self.frames.split_last()) {
            (Some(prev), Some((current, _))) if prev + 1 == current.index => {
                std::slice::from_ref(current)
            }
            _ => &self.frames,
        }
    }
}

/// File name of an input after `warp_count` reprojections.
pub fn warped_output_name(input: &Path, warp_count: usize, extension: &str) -> Option<String> {
    let stem = input.file_stem()?.to_str()?;
    Some(format!("{stem}+{warp_count}.{extension}"))
}
