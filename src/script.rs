//! # Update Script
//!
//! Builder for the device-side installation script. Commands are appended in
//! order and never modified; [`Script::render`] produces the text stored in the
//! package at [`SCRIPT_PATH`].

use std::fmt::Write as _;

/// Location of the generated script inside the update package.
pub const SCRIPT_PATH: &str = "META-INF/com/google/android/update-script";

/// Soft limit on the length of a single `delete` line.
const DELETE_LINE_LIMIT: usize = 80;

/// An ordered, append-only sequence of script commands.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Script {
    lines: Vec<String>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Appends a raw line. Used for extra script text supplied by the caller.
    pub fn push_raw(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Appends every command of another script, preserving order.
    pub fn extend(&mut self, other: Script) {
        self.lines.extend(other.lines);
    }

    pub fn comment(&mut self, text: &str) {
        self.lines.push(format!("\n# ---- {}\n", text));
    }

    pub fn assert(&mut self, expr: &str) {
        self.lines.push(format!("assert {}", expr));
    }

    pub fn format(&mut self, partition: &str) {
        self.lines.push(format!("format {}", partition));
    }

    pub fn copy_dir(&mut self, src: &str, dst: &str) {
        self.lines.push(format!("copy_dir {} {}", src, dst));
    }

    pub fn write_radio_image(&mut self, src: &str) {
        self.lines.push(format!("write_radio_image {}", src));
    }

    pub fn write_raw_image(&mut self, src: &str, partition: &str) {
        self.lines.push(format!("write_raw_image {} {}", src, partition));
    }

    /// Advances the progress bar by `fraction` of its length over roughly `seconds`.
    ///
    /// Fractions are written in shortest round-trip form so the values a
    /// script adds up to are exactly the ones that were budgeted.
    pub fn show_progress(&mut self, fraction: f64, seconds: u32) {
        self.lines.push(format!("show_progress {} {}", fraction, seconds));
    }

    pub fn run_program(&mut self, args: &[&str]) {
        self.lines.push(format!("run_program {}", args.join(" ")));
    }

    /// Deletes `paths`, batching several paths per command while keeping lines
    /// near [`DELETE_LINE_LIMIT`] characters.
    pub fn delete<S: AsRef<str>>(&mut self, paths: &[S]) {
        let mut line: Vec<&str> = Vec::new();
        let mut width = 0;
        for path in paths {
            let path = path.as_ref();
            line.push(path);
            width += path.len() + 1;
            if width > DELETE_LINE_LIMIT {
                self.lines.push(format!("delete {}", line.join(" ")));
                line.clear();
                width = 0;
            }
        }
        if !line.is_empty() {
            self.lines.push(format!("delete {}", line.join(" ")));
        }
    }

    pub fn symlink(&mut self, target: &str, link: &str) {
        self.lines.push(format!("symlink {} {}", target, link));
    }

    pub fn set_perm(&mut self, uid: u32, gid: u32, mode: u32, path: &str) {
        self.lines.push(format!("set_perm {} {} 0{:o} {}", uid, gid, mode, path));
    }

    pub fn set_perm_recursive(&mut self, uid: u32, gid: u32, dmode: u32, fmode: u32, path: &str) {
        self.lines.push(format!(
            "set_perm_recursive {} {} 0{:o} 0{:o} {}",
            uid, gid, dmode, fmode, path
        ));
    }

    /// Renders the script as stored in the package: one command per line, with a trailing newline.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            let _ = writeln!(out, "{}", line);
        }
        out
    }

    /// Sum of every `show_progress` fraction in the script.
    pub fn total_progress(&self) -> f64 {
        self.lines
            .iter()
            .filter_map(|l| l.strip_prefix("show_progress "))
            .filter_map(|rest| rest.split_whitespace().next())
            .filter_map(|f| f.parse::<f64>().ok())
            .sum()
    }
}
