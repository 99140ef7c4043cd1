//! Device-side assertions and the build metadata they are made from.

use std::collections::BTreeMap;

use regex::Regex;

use crate::error::{OtaError, Result};
use crate::script::Script;

/// Location of the build properties inside a target-files archive.
pub const BUILD_PROP: &str = "SYSTEM/build.prop";
/// Location of the board manifest carrying the bootloader requirement.
pub const ANDROID_INFO: &str = "OTA/android-info.txt";

/// Script interpreter version every package asserts compatibility with.
const SCRIPT_VERSION: &str = "0.2";

/// `key=value` build properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildProps {
    values: BTreeMap<String, String>,
}

impl BuildProps {
    /// Parses `key=value` lines. Blank lines and `#` comments are skipped,
    /// and the first definition of a key wins.
    pub fn parse(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let mut values = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values
                    .entry(key.trim().to_string())
                    .or_insert_with(|| value.trim().to_string());
            }
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Result<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| OtaError::MissingProperty(key.to_string()))
    }

    pub fn fingerprint(&self) -> Result<&str> {
        self.get("ro.build.fingerprint")
    }

    pub fn device(&self) -> Result<&str> {
        self.get("ro.product.device")
    }

    pub fn build_date_utc(&self) -> Result<&str> {
        self.get("ro.build.date.utc")
    }
}

/// Extracts the allowed bootloader versions from a board manifest.
pub fn bootloader_allow_list(manifest: &str) -> Result<Vec<String>> {
    let re = Regex::new(r"require\s+version-bootloader\s*=\s*(\S+)").expect("static regex");
    let caps = re
        .captures(manifest)
        .ok_or_else(|| OtaError::Manifest("no version-bootloader requirement in android-info.txt".into()))?;
    let versions: Vec<String> = caps[1].split('|').filter(|v| !v.is_empty()).map(str::to_string).collect();
    if versions.is_empty() {
        return Err(OtaError::Manifest("empty version-bootloader requirement".into()));
    }
    Ok(versions)
}

/// Appends the compatibility, device identity and bootloader assertions.
pub fn append_device_assertions(script: &mut Script, props: &BuildProps, manifest: &str) -> Result<()> {
    script.assert(&format!("compatible_with(\"{}\") == \"true\"", SCRIPT_VERSION));

    let device = props.device()?;
    script.assert(&format!(
        "getprop(\"ro.product.device\") == \"{0}\" || getprop(\"ro.build.product\") == \"{0}\"",
        device
    ));

    let bootloaders = bootloader_allow_list(manifest)?;
    let alternatives: Vec<String> = bootloaders
        .iter()
        .map(|b| format!("getprop(\"ro.bootloader\") == \"{}\"", b))
        .collect();
    script.assert(&alternatives.join(" || "));
    Ok(())
}

/// Accepts a device on either build, so a package can be re-applied after
/// an interrupted install.
pub fn append_fingerprint_assertion(script: &mut Script, source: &str, target: &str) {
    script.assert(&format!(
        "file_contains(\"SYSTEM:build.prop\", \"ro.build.fingerprint={}\") == \"true\" || \
         file_contains(\"SYSTEM:build.prop\", \"ro.build.fingerprint={}\") == \"true\"",
        source, target
    ));
}
