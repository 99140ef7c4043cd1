//! Build configuration: verbatim policy, patch threshold, board size limits
//! and the location of external host tools.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{OtaError, Result};

/// Default ratio of delta size to target size above which a file is sent verbatim.
pub const DEFAULT_PATCH_THRESHOLD: f64 = 0.95;
/// Key used to sign packages when none is given.
pub const DEFAULT_PACKAGE_KEY: &str = "build/target/product/security/testkey";
/// Default wall-clock limit for a single external tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(600);

/// Explicit per-path overrides of the delta/verbatim decision.
#[derive(Debug, Clone, Default)]
pub struct VerbatimPolicy {
    /// Paths that must always ship in full.
    pub require: BTreeSet<String>,
    /// Paths that must never ship in full.
    pub prohibit: BTreeSet<String>,
}

impl VerbatimPolicy {
    pub fn new<I, J, S, T>(require: I, prohibit: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            require: require.into_iter().map(Into::into).collect(),
            prohibit: prohibit.into_iter().map(Into::into).collect(),
        }
    }

    /// Rejects a policy that both requires and prohibits the same path.
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = self.require.intersection(&self.prohibit).next() {
            return Err(OtaError::Configuration(format!(
                "\"{}\" is both required and prohibited verbatim",
                path
            )));
        }
        Ok(())
    }

    pub fn requires(&self, path: &str) -> bool {
        self.require.contains(path)
    }

    pub fn prohibits(&self, path: &str) -> bool {
        self.prohibit.contains(path)
    }
}

/// Maximum image sizes parsed from a board configuration makefile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardConfig {
    /// Keyed by image name without extension: `boot`, `recovery`, `system`, `userdata`.
    pub max_image_size: BTreeMap<String, u64>,
}

impl BoardConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| OtaError::io_at(e, path))?;
        Ok(Self::parse(&text))
    }

    /// Picks up `BOARD_<NAME>IMAGE_MAX_SIZE := <bytes>` lines and ignores the rest.
    pub fn parse(text: &str) -> Self {
        let re = Regex::new(r"^BOARD_(BOOT|RECOVERY|SYSTEM|USERDATA)IMAGE_MAX_SIZE\s*:=\s*(\d+)")
            .expect("static regex");
        let mut max_image_size = BTreeMap::new();
        for line in text.lines() {
            if let Some(caps) = re.captures(line.trim()) {
                if let Ok(limit) = caps[2].parse::<u64>() {
                    max_image_size.insert(caps[1].to_lowercase(), limit);
                }
            }
        }
        Self { max_image_size }
    }

    /// Fails if `size` reaches 99% of the limit for `image`; warns from 95%.
    /// Images without a configured limit always pass.
    pub fn check_size(&self, image: &str, size: usize) -> Result<()> {
        let name = image.trim_end_matches(".img");
        let Some(&limit) = self.max_image_size.get(name) else {
            return Ok(());
        };
        let pct = size as f64 * 100.0 / limit as f64;
        let msg = format!("{} size ({}) is {:.2}% of limit ({})", name, size, pct, limit);
        if pct >= 99.0 {
            return Err(OtaError::Configuration(msg));
        } else if pct >= 95.0 {
            warn!("{}", msg);
        } else {
            debug!("{}", msg);
        }
        Ok(())
    }
}

/// Where to find external host tools and how long to let them run.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Host output directory; executables are looked up in its `bin/`.
    pub search_path: Option<PathBuf>,
    /// Explicit signapk jar; defaults to `<search_path>/framework/signapk.jar`.
    pub signapk_jar: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self { search_path: None, signapk_jar: None, timeout: Some(DEFAULT_TOOL_TIMEOUT) }
    }
}

impl ToolConfig {
    /// Resolves a host tool name, preferring `<search_path>/bin/<name>`.
    pub fn program(&self, name: &str) -> PathBuf {
        match &self.search_path {
            Some(dir) => dir.join("bin").join(name),
            None => PathBuf::from(name),
        }
    }

    pub fn signapk_jar(&self) -> PathBuf {
        if let Some(jar) = &self.signapk_jar {
            return jar.clone();
        }
        match &self.search_path {
            Some(dir) => dir.join("framework").join("signapk.jar"),
            None => PathBuf::from("signapk.jar"),
        }
    }
}

/// All knobs of a single package build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub patch_threshold: f64,
    pub verbatim: VerbatimPolicy,
    /// Also erase the user data partition.
    pub wipe_user_data: bool,
    /// Skip the build-timestamp prerequisite check in full packages.
    pub omit_prereq: bool,
    /// Script text appended after everything else.
    pub extra_script: Option<String>,
    pub board_config: Option<BoardConfig>,
    /// Enforce board image size limits; requires `board_config`.
    pub check_sizes: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            patch_threshold: DEFAULT_PATCH_THRESHOLD,
            verbatim: VerbatimPolicy::default(),
            wipe_user_data: false,
            omit_prereq: false,
            extra_script: None,
            board_config: None,
            check_sizes: false,
        }
    }
}

impl BuildOptions {
    /// Validates the option set before any archive is touched.
    pub fn validate(&self) -> Result<()> {
        self.verbatim.validate()?;
        if self.patch_threshold.is_nan() || self.patch_threshold <= 0.0 {
            return Err(OtaError::Configuration(format!(
                "patch threshold must be positive, got {}",
                self.patch_threshold
            )));
        }
        if self.check_sizes && self.board_config.is_none() {
            return Err(OtaError::Configuration(
                "image size checks requested but no board config was given".into(),
            ));
        }
        Ok(())
    }

    /// Checks an image against the board limits when size checks are enabled.
    pub fn check_image_size(&self, image: &str, size: usize) -> Result<()> {
        match (&self.board_config, self.check_sizes) {
            (Some(board), true) => board.check_size(image, size),
            _ => Ok(()),
        }
    }
}
