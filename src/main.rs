//! # scopewrap
//!
//! A CLI tool that renames a method across source files and routes its body
//! through a notify-of-change scope (by default Flutter's `setState`).
//!
//! ## Overview
//!
//! `scopewrap` works on raw text and never parses the host language. Method
//! boundaries come from brace-depth tracking alone. Every rewrite converges
//! on one canonical form, so running the tool over its own output, or over
//! text left behind by older non-idempotent rewrites, changes nothing more.
//!
//! ## Key Components
//!
//! - **Scanner**: brace-depth walk that finds the line where a block closes.
//! - **Boundary Locator**: matches declaration lines and yields [`Method`]
//!   spans lazily, in file order.
//! - **Signature Rewriter**: renames the declaration and places the marker
//!   line (e.g. `@override`) above it.
//! - **Body Wrapper**: classifies the body into a [`WrapState`] and wraps it
//!   only when it is not wrapped yet.
//! - **Repair Normalizer**: collapses stacked wrappers and redundant or
//!   annotated closing lines into the canonical single wrap.
//!
//! ## Algorithm Flow
//!
//! ```text
//! Input → Split Lines → Locate Methods → For each method (bottom-up):
//!                                          - Classify body
//!                                          - Wrap if unwrapped
//!                                          - Rename signature, add marker
//!                     → Repair → Rename Call Sites → Write if changed
//! ```
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | General error (permission denied, I/O error) |
//! | 2 | Invalid command-line arguments or rule definition |
//! | 3 | Dry-run mode: changes would be made |
//! | 4 | Parse error (invalid UTF-8 or binary input) |
//! | 5 | Incomplete: a file had an unbalanced method or a nested declaration |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::{Context, Result};
use clap::ValueEnum;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use rich_rust::terminal;
use rich_rust::{ColorSystem, Console};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

// ─────────────────────────────────────────────────────────────────────────────
// Exit Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic exit codes for scripting and CI integration
mod exit_codes {
    /// Success - completed without errors
    pub const SUCCESS: i32 = 0;
    /// General error (permission denied, I/O error)
    pub const ERROR: i32 = 1;
    /// Invalid command-line arguments or rule definition
    pub const INVALID_ARGS: i32 = 2;
    /// Dry-run mode: changes would be made
    pub const WOULD_CHANGE: i32 = 3;
    /// Parse error (invalid UTF-8 or binary file detected)
    pub const PARSE_ERROR: i32 = 4;
    /// At least one file could only be partially rewritten
    pub const INCOMPLETE: i32 = 5;
}

#[derive(Debug)]
struct ArgError(String);

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgError {}

#[derive(Debug)]
struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Default)]
struct RunOutcome {
    dry_run: bool,
    would_change: bool,
    /// Some file ended as `FailedUnbalancedBlock` or `FailedNestedSignature`
    incomplete: bool,
}

impl RunOutcome {
    fn exit_code(&self) -> i32 {
        if self.incomplete {
            exit_codes::INCOMPLETE
        } else if self.dry_run && self.would_change {
            exit_codes::WOULD_CHANGE
        } else {
            exit_codes::SUCCESS
        }
    }
}

fn error_chain_has<T: std::error::Error + 'static>(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<T>())
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if error_chain_has::<ArgError>(err) {
        exit_codes::INVALID_ARGS
    } else if error_chain_has::<ParseError>(err) {
        exit_codes::PARSE_ERROR
    } else {
        exit_codes::ERROR
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CLI Arguments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ColorMode {
    /// Auto-detect color support
    Auto,
    /// Always emit colors (even when not a TTY)
    Always,
    /// Never emit colors
    Never,
}

/// Structural method rewriter: renames a method and wraps its body in a notify-of-change scope
#[derive(Parser, Debug)]
#[command(
    name = "scopewrap",
    version,
    about,
    long_about = None,
    after_help = "EXIT CODES:\n  0  Success\n  1  General error (permission denied, I/O error)\n  2  Invalid command-line arguments or rule definition\n  3  Dry-run mode: changes would be made\n  4  Parse error (invalid UTF-8 or binary input)\n  5  Incomplete: a file had an unbalanced method or a nested declaration\n"
)]
struct Args {
    /// Source file(s) to rewrite in place, relative to --base-dir when given.
    /// Reads from stdin and writes to stdout if no file is provided.
    #[arg(value_name = "FILE")]
    inputs: Vec<PathBuf>,

    /// Directory that relative file names are resolved against
    #[arg(short = 'C', long = "base-dir", value_name = "DIR")]
    base_dir: Option<PathBuf>,

    /// Read more file names from a list (one per line, '#' starts a comment)
    #[arg(long = "files-from", value_name = "FILE")]
    files_from: Option<PathBuf>,

    /// Path to config file (default: search for .scopewraprc)
    #[arg(long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Ignore config files
    #[arg(long = "no-config")]
    no_config: bool,

    /// Process files recursively in directories
    #[arg(short = 'r', long)]
    recursive: bool,

    /// Glob pattern to match files when recursing (comma-separated)
    #[arg(long, default_value = "*.dart", requires = "recursive")]
    glob: String,

    /// Do not respect .gitignore when recursing
    #[arg(long = "no-gitignore", requires = "recursive")]
    no_gitignore: bool,

    /// Maximum directory depth (0 = unlimited)
    #[arg(long, default_value = "0", requires = "recursive")]
    max_depth: usize,

    /// Method name to rename (replaces the rules from the config file)
    #[arg(long, value_name = "NAME", requires = "to")]
    from: Option<String>,

    /// New method name
    #[arg(long, value_name = "NAME", requires = "from")]
    to: Option<String>,

    /// Declaration template; `{name}` stands for the method name
    #[arg(long, value_name = "TEMPLATE")]
    declaration: Option<String>,

    /// Marker line kept directly above every rewritten declaration
    #[arg(long, value_name = "LINE", conflicts_with = "no_marker")]
    marker: Option<String>,

    /// Do not insert a marker line
    #[arg(long = "no-marker")]
    no_marker: bool,

    /// Line that opens the notify-of-change scope
    #[arg(long, value_name = "LINE")]
    wrap_open: Option<String>,

    /// Line that closes the notify-of-change scope
    #[arg(long, value_name = "LINE")]
    wrap_close: Option<String>,

    /// Annotated closing line left by older rewrites (normalized on repair)
    #[arg(long, value_name = "LINE")]
    legacy_close: Option<String>,

    /// Spaces per indentation level when it cannot be inferred from the body
    #[arg(long, default_value = "2")]
    indent_unit: usize,

    /// Keep body lines at their original indentation when wrapping
    #[arg(long = "no-reindent")]
    no_reindent: bool,

    /// Verbose output showing every located method
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Color output: auto, always, or never
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorMode,

    /// Show unified diff of changes instead of writing files
    #[arg(short = 'd', long)]
    diff: bool,

    /// Preview changes without modifying files (exit 0=no changes, 3=would change)
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Watch the input files and rewrite them whenever they change
    #[arg(short = 'w', long, conflicts_with_all = ["recursive", "diff", "dry_run", "json"])]
    watch: bool,

    /// Debounce interval in milliseconds (for --watch mode)
    #[arg(long, default_value = "500", requires = "watch")]
    debounce_ms: u64,

    /// Create a backup of each file before rewriting it
    #[arg(long)]
    backup: bool,

    /// Extension for backup files (default: .bak)
    #[arg(long, default_value = ".bak", requires = "backup")]
    backup_ext: String,

    /// Output results as JSON for programmatic processing
    #[arg(long, conflicts_with_all = ["verbose", "diff"])]
    json: bool,

    /// Subcommand (config management)
    #[command(subcommand)]
    command: Option<Commands>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config management actions
#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Initialize a new .scopewraprc config file
    Init {
        /// Create in home directory instead of current
        #[arg(long)]
        global: bool,
    },
    /// Show effective configuration (merged file + CLI)
    Show,
    /// Show path to active config file
    Path,
}

// ─────────────────────────────────────────────────────────────────────────────
// Rewrite Rules
// ─────────────────────────────────────────────────────────────────────────────

const NAME_PLACEHOLDER: &str = "{name}";
const DEFAULT_OLD_NAME: &str = "_generateQuestion";
const DEFAULT_NEW_NAME: &str = "generateNewQuestion";
const DEFAULT_DECLARATION: &str = "void {name}()";
const DEFAULT_MARKER: &str = "@override";
const DEFAULT_WRAP_OPEN: &str = "setState(() {";
const DEFAULT_WRAP_CLOSE: &str = "});";
const DEFAULT_LEGACY_CLOSE: &str = "}); // setState";

/// A rewrite rule as written in a config file or assembled from CLI flags.
///
/// Unset fields fall back to the built-in `setState` rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct RuleConfig {
    /// Method name to replace
    from: String,
    /// Replacement method name
    to: String,
    /// Declaration template containing `{name}`
    declaration: Option<String>,
    /// Marker line; an empty string disables it
    marker: Option<String>,
    /// Opening line of the notify scope
    wrap_open: Option<String>,
    /// Canonical closing line of the notify scope
    wrap_close: Option<String>,
    /// Annotated closing line produced by older rewrites
    legacy_close: Option<String>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self::named(DEFAULT_OLD_NAME, DEFAULT_NEW_NAME)
    }
}

impl RuleConfig {
    fn named(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            declaration: None,
            marker: None,
            wrap_open: None,
            wrap_close: None,
            legacy_close: None,
        }
    }
}

/// A validated rule with its compiled declaration pattern.
#[derive(Debug, Clone)]
struct RewriteRule {
    old_name: String,
    new_name: String,
    declaration: String,
    marker: Option<String>,
    wrap_open: String,
    wrap_close: String,
    legacy_close: String,
    /// Matches a full declaration line ending in `{`, naming either the old
    /// or the new method name in the `name` group
    pattern: Regex,
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_identifier_char)
}

/// Turn a literal template fragment into a regex, letting any whitespace run
/// match any amount of whitespace.
fn template_fragment(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    let mut in_whitespace = false;
    let mut buf = [0u8; 4];

    for c in text.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                out.push_str(r"\s+");
                in_whitespace = true;
            }
        } else {
            in_whitespace = false;
            out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
        }
    }

    out
}

fn compile_declaration_pattern(
    declaration: &str,
    old_name: &str,
    new_name: &str,
) -> Result<Regex, ArgError> {
    let (prefix, suffix) = declaration.split_once(NAME_PLACEHOLDER).ok_or_else(|| {
        ArgError(format!(
            "Declaration template '{}' must contain {}",
            declaration, NAME_PLACEHOLDER
        ))
    })?;

    let names = if old_name == new_name {
        regex::escape(old_name)
    } else {
        format!("{}|{}", regex::escape(old_name), regex::escape(new_name))
    };

    let source = format!(
        r"^[ \t]*{}(?P<name>{}){}\s*\{{\s*$",
        template_fragment(prefix),
        names,
        template_fragment(suffix)
    );

    Regex::new(&source)
        .map_err(|err| ArgError(format!("Invalid declaration template '{}': {}", declaration, err)))
}

impl RewriteRule {
    fn from_config(rule: &RuleConfig) -> Result<Self, ArgError> {
        let old_name = rule.from.trim().to_string();
        let new_name = rule.to.trim().to_string();
        for name in [&old_name, &new_name] {
            if !is_identifier(name) {
                return Err(ArgError(format!(
                    "Method name '{}' is not a valid identifier",
                    name
                )));
            }
        }

        let declaration = rule
            .declaration
            .as_deref()
            .unwrap_or(DEFAULT_DECLARATION)
            .trim()
            .to_string();
        if declaration.matches(NAME_PLACEHOLDER).count() != 1 {
            return Err(ArgError(format!(
                "Declaration template '{}' must contain {} exactly once",
                declaration, NAME_PLACEHOLDER
            )));
        }

        let marker = match rule.marker.as_deref() {
            None => Some(DEFAULT_MARKER.to_string()),
            Some(m) if m.trim().is_empty() => None,
            Some(m) => Some(m.trim().to_string()),
        };

        let wrap_open = rule
            .wrap_open
            .as_deref()
            .unwrap_or(DEFAULT_WRAP_OPEN)
            .trim()
            .to_string();
        let wrap_close = rule
            .wrap_close
            .as_deref()
            .unwrap_or(DEFAULT_WRAP_CLOSE)
            .trim()
            .to_string();
        let legacy_close = rule
            .legacy_close
            .as_deref()
            .unwrap_or(DEFAULT_LEGACY_CLOSE)
            .trim()
            .to_string();

        if brace_delta(&wrap_open) != 1 {
            return Err(ArgError(format!(
                "--wrap-open '{}' must open exactly one brace block",
                wrap_open
            )));
        }
        if brace_delta(&wrap_close) != -1 {
            return Err(ArgError(format!(
                "--wrap-close '{}' must close exactly one brace block",
                wrap_close
            )));
        }
        if brace_delta(&legacy_close) != -1 || legacy_close == wrap_close {
            return Err(ArgError(format!(
                "--legacy-close '{}' must close one brace block and differ from --wrap-close",
                legacy_close
            )));
        }

        let pattern = compile_declaration_pattern(&declaration, &old_name, &new_name)?;

        Ok(Self {
            old_name,
            new_name,
            declaration,
            marker,
            wrap_open,
            wrap_close,
            legacy_close,
            pattern,
        })
    }

    /// Return the method name if `line` is a declaration this rule targets.
    fn match_declaration<'l>(&self, line: &'l str) -> Option<&'l str> {
        self.pattern
            .captures(line)
            .and_then(|caps| caps.name("name"))
            .map(|m| m.as_str())
    }

    fn is_wrap_open(&self, line: &str) -> bool {
        line.trim() == self.wrap_open
    }

    fn is_wrap_close(&self, line: &str) -> bool {
        line.trim() == self.wrap_close
    }

    fn is_legacy_close(&self, line: &str) -> bool {
        line.trim() == self.legacy_close
    }

    /// Canonical or legacy closing line
    fn is_close_form(&self, line: &str) -> bool {
        self.is_wrap_close(line) || self.is_legacy_close(line)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime configuration derived from CLI args and the config file
#[derive(Debug)]
struct Config {
    rules: Vec<RewriteRule>,
    indent_unit: String,
    reindent: bool,
    base_dir: Option<PathBuf>,
    recursive: bool,
    glob: String,
    gitignore: bool,
    max_depth: usize,
    color: ColorMode,
    verbose: bool,
    diff: bool,
    dry_run: bool,
    watch: bool,
    debounce_ms: u64,
    backup: bool,
    backup_ext: String,
    json: bool,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            rules: Vec::new(),
            indent_unit: " ".repeat(args.indent_unit),
            reindent: !args.no_reindent,
            base_dir: args.base_dir.clone(),
            recursive: args.recursive,
            glob: args.glob.clone(),
            gitignore: !args.no_gitignore,
            max_depth: args.max_depth,
            color: args.color,
            verbose: args.verbose,
            diff: args.diff,
            dry_run: args.dry_run,
            watch: args.watch,
            debounce_ms: args.debounce_ms,
            backup: args.backup,
            backup_ext: args.backup_ext.clone(),
            json: args.json,
        }
    }
}

struct VerboseStyle {
    use_color: bool,
}

impl VerboseStyle {
    fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    fn wrap(&self, tag: &str, text: impl fmt::Display) -> String {
        if self.use_color {
            format!("[{}]{}[/]", tag, text)
        } else {
            text.to_string()
        }
    }

    fn header(&self, text: impl fmt::Display) -> String {
        self.wrap("bold cyan", text)
    }

    fn method(&self, text: impl fmt::Display) -> String {
        self.wrap("yellow", text)
    }

    fn success(&self, text: impl fmt::Display) -> String {
        self.wrap("bold green", text)
    }

    fn warning(&self, text: impl fmt::Display) -> String {
        self.wrap("bold red", text)
    }

    fn dim(&self, text: impl fmt::Display) -> String {
        self.wrap("dim", text)
    }

    fn bold(&self, text: impl fmt::Display) -> String {
        self.wrap("bold", text)
    }

    fn stat_label(&self, text: impl fmt::Display) -> String {
        self.wrap("bold blue", text)
    }

    fn separator(&self) -> String {
        self.wrap("dim", "───")
    }
}

/// Statistics collected while rewriting
#[derive(Debug, Default, Clone)]
struct Stats {
    /// Declarations located with a balanced body
    methods_found: usize,
    /// Bodies that received a new wrapper
    methods_wrapped: usize,
    /// Bodies already in canonical form
    methods_canonical: usize,
    /// Bodies classified as legacy or double-wrapped
    methods_repaired: usize,
    /// Declarations skipped because their braces never balance
    methods_skipped: usize,
    /// Declarations whose name was changed
    signatures_renamed: usize,
    /// Marker lines inserted above declarations
    markers_inserted: usize,
    /// Individual repair edits (collapsed openers, removed or normalized closers)
    repairs_applied: usize,
    /// Old-name references renamed outside the declarations
    call_sites_renamed: usize,
    /// Total number of lines processed
    total_lines: usize,
    /// Processing elapsed time
    elapsed: Duration,
}

impl Stats {
    /// Merge another Stats into this one (for aggregating across files)
    fn merge(&mut self, other: &Stats) {
        self.methods_found += other.methods_found;
        self.methods_wrapped += other.methods_wrapped;
        self.methods_canonical += other.methods_canonical;
        self.methods_repaired += other.methods_repaired;
        self.methods_skipped += other.methods_skipped;
        self.signatures_renamed += other.signatures_renamed;
        self.markers_inserted += other.markers_inserted;
        self.repairs_applied += other.repairs_applied;
        self.call_sites_renamed += other.call_sites_renamed;
        self.total_lines += other.total_lines;
        self.elapsed += other.elapsed;
    }

    /// Calculate lines processed per second
    fn lines_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_lines as f64 / secs
        } else {
            self.total_lines as f64
        }
    }
}

/// Per-outcome file counts for the summary
#[derive(Debug, Default, Clone, Copy)]
struct OutcomeTally {
    fixed: usize,
    unchanged: usize,
    skipped_missing: usize,
    skipped_no_match: usize,
    failed: usize,
}

impl OutcomeTally {
    fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Fixed => self.fixed += 1,
            FileOutcome::Unchanged => self.unchanged += 1,
            FileOutcome::SkippedMissing => self.skipped_missing += 1,
            FileOutcome::SkippedNoMatch => self.skipped_no_match += 1,
            FileOutcome::FailedUnbalancedBlock | FileOutcome::FailedNestedSignature => {
                self.failed += 1
            }
        }
    }

    fn total(&self) -> usize {
        self.fixed + self.unchanged + self.skipped_missing + self.skipped_no_match + self.failed
    }
}

/// Print a statistics summary to stderr
fn print_stats_summary(
    stats: &Stats,
    tally: &OutcomeTally,
    errors: usize,
    console: &Console,
    styles: &VerboseStyle,
) {
    console.print("");
    console.print(&format!(
        "{} Summary {}",
        styles.separator(),
        styles.separator()
    ));

    if tally.total() > 1 {
        console.print(&format!(
            "  {} {} processed, {} fixed, {} unchanged, {} missing, {} without match, {} failed",
            styles.stat_label("Files:"),
            tally.total(),
            tally.fixed,
            tally.unchanged,
            tally.skipped_missing,
            tally.skipped_no_match,
            tally.failed
        ));
    }

    console.print(&format!(
        "  {} {} found, {} wrapped, {} already canonical, {} repaired, {} skipped",
        styles.stat_label("Methods:"),
        stats.methods_found,
        stats.methods_wrapped,
        stats.methods_canonical,
        stats.methods_repaired,
        stats.methods_skipped
    ));

    console.print(&format!(
        "  {} {} signature(s), {} marker(s), {} call site(s), {} repair(s)",
        styles.stat_label("Edits:"),
        stats.signatures_renamed,
        stats.markers_inserted,
        stats.call_sites_renamed,
        stats.repairs_applied
    ));

    let elapsed_ms = stats.elapsed.as_secs_f64() * 1000.0;
    console.print(&format!(
        "  {} {:.2}ms ({:.0} lines/sec)",
        styles.stat_label("Time:"),
        elapsed_ms,
        stats.lines_per_second()
    ));

    if errors > 0 {
        console.print(&format!("  {} {}", styles.warning("Errors:"), errors));
    }

    console.print("");
}

fn build_console(color: ColorMode) -> (Console, VerboseStyle) {
    let forced = || {
        let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
        let console = Console::builder()
            .force_terminal(true)
            .color_system(system)
            .build();
        (console, VerboseStyle::new(true))
    };

    match color {
        ColorMode::Never => (Console::new(), VerboseStyle::new(false)),
        ColorMode::Always => forced(),
        ColorMode::Auto => {
            if std::env::var("NO_COLOR").is_ok() {
                return (Console::new(), VerboseStyle::new(false));
            }
            if std::env::var("FORCE_COLOR").is_ok() {
                return forced();
            }

            let console = Console::new();
            let use_color = console.is_color_enabled();
            (console, VerboseStyle::new(use_color))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config File Support
// ─────────────────────────────────────────────────────────────────────────────

/// Config file names searched in order
const CONFIG_FILENAMES: &[&str] = &[".scopewraprc", ".scopewraprc.toml", "scopewraprc.toml"];

/// Configuration loaded from a .scopewraprc file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    /// Spaces per indentation level used when it cannot be inferred
    indent_unit: Option<usize>,
    /// Shift wrapped body lines one level right
    reindent: Option<bool>,
    /// Directory file names are resolved against (relative to the config file)
    base_dir: Option<PathBuf>,
    /// Show verbose output
    verbose: Option<bool>,
    /// Color mode: auto, always, never
    color: Option<ColorMode>,
    /// Output as JSON
    json: Option<bool>,
    /// Create backup before rewriting
    backup: Option<bool>,
    /// Backup file extension
    backup_ext: Option<String>,
    /// Enable recursive mode
    recursive: Option<bool>,
    /// Glob patterns for recursive mode
    glob: Option<String>,
    /// Respect .gitignore
    gitignore: Option<bool>,
    /// Maximum directory depth
    max_depth: Option<usize>,
    /// Rewrite rules, applied in order
    #[serde(rename = "rule")]
    rules: Vec<RuleConfig>,
}

/// Search for a config file starting from the given directory
fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    loop {
        for filename in CONFIG_FILENAMES {
            let config_path = current.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    let home = dirs::home_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|filename| home.join(filename))
        .find(|path| path.exists())
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Directory the config file search starts from
fn config_search_start(args: &Args) -> PathBuf {
    if let Some(base) = &args.base_dir {
        return base.clone();
    }

    args.inputs
        .first()
        .and_then(|p| {
            if p.is_dir() {
                Some(p.clone())
            } else {
                p.parent().map(|p| p.to_path_buf())
            }
        })
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
}

/// Apply the rule-shape flags to a rule coming from the file or the defaults
fn apply_rule_overrides(args: &Args, rule: &mut RuleConfig) {
    if let Some(declaration) = &args.declaration {
        rule.declaration = Some(declaration.clone());
    }
    if args.no_marker {
        rule.marker = Some(String::new());
    } else if let Some(marker) = &args.marker {
        rule.marker = Some(marker.clone());
    }
    if let Some(open) = &args.wrap_open {
        rule.wrap_open = Some(open.clone());
    }
    if let Some(close) = &args.wrap_close {
        rule.wrap_close = Some(close.clone());
    }
    if let Some(legacy) = &args.legacy_close {
        rule.legacy_close = Some(legacy.clone());
    }
}

/// Create Config by merging file config with CLI args (CLI wins)
fn create_config(args: &Args) -> Result<Config> {
    let mut config = Config::from(args);
    let mut rule_configs: Vec<RuleConfig> = Vec::new();

    let config_path = if args.no_config {
        None
    } else if let Some(ref path) = args.config_file {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        Some(path.clone())
    } else {
        find_config_file(&config_search_start(args))
    };

    if let Some(path) = config_path {
        let file_config = load_config_file(&path)?;

        // File values only apply where the CLI kept its default
        if args.indent_unit == 2 {
            if let Some(width) = file_config.indent_unit {
                if width == 0 || width > 8 {
                    return Err(ArgError(format!(
                        "indent_unit in {} must be between 1 and 8",
                        path.display()
                    ))
                    .into());
                }
                config.indent_unit = " ".repeat(width);
            }
        }

        if !args.no_reindent {
            if let Some(r) = file_config.reindent {
                config.reindent = r;
            }
        }

        if args.base_dir.is_none() {
            if let Some(dir) = file_config.base_dir {
                let anchored = match path.parent() {
                    Some(parent) if dir.is_relative() => parent.join(dir),
                    _ => dir,
                };
                config.base_dir = Some(anchored);
            }
        }

        if !args.verbose {
            if let Some(v) = file_config.verbose {
                config.verbose = v;
            }
        }

        if args.color == ColorMode::Auto {
            if let Some(c) = file_config.color {
                config.color = c;
            }
        }

        if !args.json {
            if let Some(j) = file_config.json {
                config.json = j;
            }
        }

        if !args.backup {
            if let Some(b) = file_config.backup {
                config.backup = b;
            }
        }

        if args.backup_ext == ".bak" {
            if let Some(ext) = file_config.backup_ext {
                config.backup_ext = ext;
            }
        }

        if !args.recursive {
            if let Some(r) = file_config.recursive {
                config.recursive = r;
            }
        }

        if args.glob == "*.dart" {
            if let Some(g) = file_config.glob {
                config.glob = g;
            }
        }

        if !args.no_gitignore {
            if let Some(gi) = file_config.gitignore {
                config.gitignore = gi;
            }
        }

        if args.max_depth == 0 {
            if let Some(d) = file_config.max_depth {
                config.max_depth = d;
            }
        }

        rule_configs = file_config.rules;
    }

    if let (Some(from), Some(to)) = (&args.from, &args.to) {
        rule_configs = vec![RuleConfig::named(from, to)];
    } else if rule_configs.is_empty() {
        rule_configs.push(RuleConfig::default());
    }

    for rule in &mut rule_configs {
        apply_rule_overrides(args, rule);
    }

    config.rules = rule_configs
        .iter()
        .map(RewriteRule::from_config)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(config)
}

/// Default config file content
const DEFAULT_CONFIG: &str = r#"# .scopewraprc - scopewrap configuration file

# Spaces per indentation level, used when the method body does not show one
indent_unit = 2

# Shift wrapped body lines one level to the right
# reindent = true

# Directory that file names are resolved against (relative to this file)
# base_dir = "lib/ui/activities"

# Output options
# verbose = false
# color = "auto"
# json = false

# Backup options
# backup = false
# backup_ext = ".bak"

# Recursive mode defaults
# recursive = false
# glob = "*.dart"
# gitignore = true
# max_depth = 0

# Rewrite rules, applied in order. Without any [[rule]] table the built-in
# _generateQuestion -> generateNewQuestion rule below is used.
[[rule]]
from = "_generateQuestion"
to = "generateNewQuestion"
declaration = "void {name}()"
marker = "@override"
wrap_open = "setState(() {"
wrap_close = "});"
legacy_close = "}); // setState"
"#;

/// Handle the config subcommand
fn run_config_command(action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { global } => {
            let path = if *global {
                dirs::home_dir()
                    .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?
                    .join(".scopewraprc")
            } else {
                PathBuf::from(".scopewraprc")
            };

            if path.exists() {
                return Err(anyhow::anyhow!(
                    "Config file already exists: {}",
                    path.display()
                ));
            }

            fs::write(&path, DEFAULT_CONFIG)
                .with_context(|| format!("Failed to create config file: {}", path.display()))?;

            eprintln!("Created config file: {}", path.display());
            Ok(())
        }

        ConfigAction::Show => {
            let args = Args::parse_from(["scopewrap"]);
            let config = create_config(&args)?;

            eprintln!("Effective configuration:");
            eprintln!("  indent_unit: {}", config.indent_unit.len());
            eprintln!("  reindent: {}", config.reindent);
            if let Some(ref base) = config.base_dir {
                eprintln!("  base_dir: {}", base.display());
            }
            eprintln!("  verbose: {}", config.verbose);
            eprintln!("  color: {:?}", config.color);
            eprintln!("  json: {}", config.json);
            eprintln!("  backup: {}", config.backup);
            eprintln!("  backup_ext: {}", config.backup_ext);
            eprintln!("  recursive: {}", config.recursive);
            eprintln!("  glob: {}", config.glob);
            eprintln!("  gitignore: {}", config.gitignore);
            eprintln!("  max_depth: {}", config.max_depth);
            for (i, rule) in config.rules.iter().enumerate() {
                eprintln!("  rule {}:", i + 1);
                eprintln!("    {} -> {}", rule.old_name, rule.new_name);
                eprintln!("    declaration: {}", rule.declaration);
                eprintln!("    marker: {}", rule.marker.as_deref().unwrap_or("(none)"));
                eprintln!("    wrap: {} ... {}", rule.wrap_open, rule.wrap_close);
                eprintln!("    legacy close: {}", rule.legacy_close);
            }

            let start_dir = std::env::current_dir().unwrap_or_default();
            if let Some(path) = find_config_file(&start_dir) {
                eprintln!();
                eprintln!("Config file: {}", path.display());
            }

            Ok(())
        }

        ConfigAction::Path => {
            let start_dir = std::env::current_dir().unwrap_or_default();
            if let Some(path) = find_config_file(&start_dir) {
                println!("{}", path.display());
                Ok(())
            } else {
                eprintln!("No config file found");
                std::process::exit(1);
            }
        }
    }
}

fn validate_args(args: &Args) -> Result<()> {
    if args.indent_unit == 0 || args.indent_unit > 8 {
        return Err(ArgError("--indent-unit must be between 1 and 8".to_string()).into());
    }

    let has_file_inputs = !args.inputs.is_empty() || args.files_from.is_some();

    if args.recursive && !has_file_inputs {
        return Err(ArgError("--recursive requires at least one input path".to_string()).into());
    }

    if args.watch && !has_file_inputs {
        return Err(ArgError("--watch requires at least one input file".to_string()).into());
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Source Buffer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    fn as_str(self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
        }
    }
}

/// The lines of one file, plus what is needed to write it back.
///
/// Lines are split on `\n` with any trailing `\r` dropped, so files with
/// mixed endings still yield one entry per line. `render` uses the majority
/// ending; a single-ending file comes back byte for byte, and callers keep
/// the original text when no line changed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceBuffer {
    lines: Vec<String>,
    ending: LineEnding,
    trailing_newline: bool,
}

impl SourceBuffer {
    fn parse(text: &str) -> Self {
        let crlf = text.matches("\r\n").count();
        let lf = text.matches('\n').count() - crlf;
        let ending = if crlf > lf {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        };
        let trailing_newline = text.ends_with('\n');
        let body = text.strip_suffix('\n').unwrap_or(text);

        let lines = if text.is_empty() {
            Vec::new()
        } else {
            body.split('\n')
                .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
                .collect()
        };

        Self {
            lines,
            ending,
            trailing_newline,
        }
    }

    fn render(&self) -> String {
        let separator = self.ending.as_str();
        let mut out = self.lines.join(separator);
        if self.trailing_newline {
            out.push_str(separator);
        }
        out
    }
}

fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

fn next_non_blank(lines: &[String], from: usize) -> Option<usize> {
    (from..lines.len()).find(|&i| !lines[i].trim().is_empty())
}

// ─────────────────────────────────────────────────────────────────────────────
// Scanner
// ─────────────────────────────────────────────────────────────────────────────

/// Failures while locating methods.
///
/// Line numbers are 0-based indices into the buffer; `Display` shows them
/// 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EngineError {
    /// The block opened on `start` never returns to depth zero.
    ///
    /// Recoverable per method: the method is skipped and scanning continues.
    UnbalancedBlock { start: usize },

    /// A declaration matched inside the body of a method located earlier.
    ///
    /// Signals a declaration pattern that is too permissive; the file is
    /// left untouched.
    NestedSignatureConflict { line: usize, enclosing: usize },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnbalancedBlock { start } => write!(
                f,
                "block opened on line {} never closes before end of file",
                start + 1
            ),
            Self::NestedSignatureConflict { line, enclosing } => write!(
                f,
                "declaration on line {} lies inside the method declared on line {}",
                line + 1,
                enclosing + 1
            ),
        }
    }
}

impl std::error::Error for EngineError {}

/// Net brace depth change of a line (`{` minus `}`), counted per character.
///
/// Braces inside string or comment literals are counted too.
fn brace_delta(line: &str) -> isize {
    line.chars().fold(0, |depth, c| match c {
        '{' => depth + 1,
        '}' => depth - 1,
        _ => depth,
    })
}

/// Find the line that closes the block opened on `start`.
///
/// `start` must leave the depth at 1. Returns the first later line where the
/// running depth is exactly zero. A line that drives it below zero (such as
/// `}}` closing the block and its parent) has no clean end and counts as
/// unbalanced.
fn locate_block_end(lines: &[String], start: usize) -> Result<usize, EngineError> {
    let mut depth: isize = 1;

    for (idx, line) in lines.iter().enumerate().skip(start + 1) {
        depth += brace_delta(line);
        match depth {
            0 => return Ok(idx),
            d if d < 0 => break,
            _ => {}
        }
    }

    Err(EngineError::UnbalancedBlock { start })
}

/// Walk backwards from a closing line to the line that opened its block.
fn locate_block_start(lines: &[String], end: usize) -> Option<usize> {
    let mut depth = -brace_delta(&lines[end]);
    if depth <= 0 {
        return None;
    }

    for idx in (0..end).rev() {
        depth -= brace_delta(&lines[idx]);
        match depth {
            0 => return Some(idx),
            d if d < 0 => return None,
            _ => {}
        }
    }

    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Boundary Locator
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanKind {
    Signature,
    Body,
    WrapperOpen,
    WrapperClose,
}

/// Inclusive range of buffer lines with a role tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
    kind: SpanKind,
}

impl Span {
    fn new(start: usize, end: usize, kind: SpanKind) -> Self {
        debug_assert!(start <= end, "span start {} after end {}", start, end);
        Self { start, end, kind }
    }

    fn line(line: usize, kind: SpanKind) -> Self {
        Self::new(line, line, kind)
    }

    fn contains(&self, line: usize) -> bool {
        (self.start..=self.end).contains(&line)
    }
}

/// One located method declaration.
///
/// `body` runs from the declaration line (depth 1 after it) to the line
/// where the depth returns to exactly zero.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Method {
    /// Name found on the declaration line (old or already renamed)
    name: String,
    signature: Span,
    body: Span,
    /// Leading whitespace of the declaration line
    indent: String,
    /// One indentation level, inferred from the body
    indent_unit: String,
}

impl Method {
    /// Lines strictly between the declaration and the closing brace
    fn interior(&self) -> Range<usize> {
        self.body.start + 1..self.body.end
    }
}

/// Indentation of the first body line indented deeper than the declaration.
fn infer_indent_unit(body: &[String], indent: &str) -> Option<String> {
    body.iter()
        .filter(|line| !line.trim().is_empty())
        .find_map(|line| {
            leading_whitespace(line)
                .strip_prefix(indent)
                .filter(|unit| !unit.is_empty())
                .map(str::to_string)
        })
}

/// Lazy, single-pass iterator over the methods a rule targets in a buffer.
///
/// Yields in file order. After an `UnbalancedBlock` the scan resumes on the
/// next line; after a `NestedSignatureConflict` callers are expected to stop.
struct MethodLocator<'a> {
    lines: &'a [String],
    rule: &'a RewriteRule,
    fallback_unit: &'a str,
    next_line: usize,
    enclosing: Option<Span>,
}

impl Iterator for MethodLocator<'_> {
    type Item = Result<Method, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines;

        while self.next_line < lines.len() {
            let idx = self.next_line;
            self.next_line += 1;

            let line = &lines[idx];
            let Some(name) = self.rule.match_declaration(line) else {
                continue;
            };
            if brace_delta(line) != 1 {
                continue;
            }

            if let Some(body) = self.enclosing {
                if body.contains(idx) {
                    return Some(Err(EngineError::NestedSignatureConflict {
                        line: idx,
                        enclosing: body.start,
                    }));
                }
            }

            let end = match locate_block_end(lines, idx) {
                Ok(end) => end,
                Err(err) => return Some(Err(err)),
            };

            let body = Span::new(idx, end, SpanKind::Body);
            self.enclosing = Some(body);

            let indent = leading_whitespace(line).to_string();
            let indent_unit = infer_indent_unit(&lines[idx + 1..end], &indent)
                .unwrap_or_else(|| self.fallback_unit.to_string());

            return Some(Ok(Method {
                name: name.to_string(),
                signature: Span::line(idx, SpanKind::Signature),
                body,
                indent,
                indent_unit,
            }));
        }

        None
    }
}

fn find_methods<'a>(
    lines: &'a [String],
    rule: &'a RewriteRule,
    fallback_unit: &'a str,
) -> MethodLocator<'a> {
    MethodLocator {
        lines,
        rule,
        fallback_unit,
        next_line: 0,
        enclosing: None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signature Rewriter
// ─────────────────────────────────────────────────────────────────────────────

/// Replace whole-identifier occurrences of `old` with `new`.
///
/// Returns the rewritten text and the number of replacements.
fn replace_identifier(text: &str, old: &str, new: &str) -> (String, usize) {
    let mut out = String::with_capacity(text.len());
    let mut count = 0;
    let mut last = 0;

    for (pos, _) in text.match_indices(old) {
        let before = text[..pos].chars().next_back();
        let after = text[pos + old.len()..].chars().next();
        if before.is_some_and(is_identifier_char) || after.is_some_and(is_identifier_char) {
            continue;
        }

        out.push_str(&text[last..pos]);
        out.push_str(new);
        last = pos + old.len();
        count += 1;
    }

    out.push_str(&text[last..]);
    (out, count)
}

/// What the signature rewrite changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SignatureEdit {
    renamed: bool,
    marker_inserted: bool,
}

/// Rename the declaration and make sure the marker sits directly above it.
///
/// Runs after the body edits of the same method: the marker line shifts
/// everything below the declaration down by one.
fn rewrite_signature(lines: &mut Vec<String>, method: &Method, rule: &RewriteRule) -> SignatureEdit {
    let mut edit = SignatureEdit::default();
    let sig = method.signature.start;

    if rule.old_name != rule.new_name {
        let (renamed, count) = replace_identifier(&lines[sig], &rule.old_name, &rule.new_name);
        if count > 0 {
            lines[sig] = renamed;
            edit.renamed = true;
        }
    }

    if let Some(marker) = &rule.marker {
        edit.marker_inserted = ensure_marker(lines, sig, &method.indent, marker);
    }

    edit
}

/// Insert `marker` above the line at `sig` unless it is already there.
fn ensure_marker(lines: &mut Vec<String>, sig: usize, indent: &str, marker: &str) -> bool {
    let present = sig
        .checked_sub(1)
        .is_some_and(|prev| lines[prev].trim() == marker);
    if !present {
        lines.insert(sig, format!("{}{}", indent, marker));
    }
    !present
}

/// Rename every remaining reference to the old name. Returns the count.
fn rename_call_sites(lines: &mut [String], rule: &RewriteRule) -> usize {
    if rule.old_name == rule.new_name {
        return 0;
    }

    let mut total = 0;
    for line in lines.iter_mut() {
        let (renamed, count) = replace_identifier(line, &rule.old_name, &rule.new_name);
        if count > 0 {
            *line = renamed;
            total += count;
        }
    }
    total
}

// ─────────────────────────────────────────────────────────────────────────────
// Body Wrapper
// ─────────────────────────────────────────────────────────────────────────────

/// How a method body relates to the notify-of-change scope.
///
/// Each state has exactly one next action, and every action ends in
/// `CanonicalWrap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WrapState {
    /// No wrapper spans the body: wrap it.
    Unwrapped,

    /// The body is exactly one wrapper with the canonical closer: no-op.
    ///
    /// ```text
    /// void generateNewQuestion() {
    ///   setState(() {
    ///     score = score + 1;
    ///   });
    /// }
    /// ```
    CanonicalWrap,

    /// One wrapper, closed with the annotated legacy line: normalize it.
    ///
    /// ```text
    ///   }); // setState
    /// ```
    LegacyWrap,

    /// Wrapped twice, or closed twice, by an earlier rewrite: repair it.
    CorruptedDoubleWrap,
}

impl fmt::Display for WrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unwrapped => "unwrapped",
            Self::CanonicalWrap => "canonical",
            Self::LegacyWrap => "legacy close",
            Self::CorruptedDoubleWrap => "double wrap",
        };
        f.write_str(label)
    }
}

/// Classify a method body by the lines just inside its boundaries.
fn classify_body(lines: &[String], method: &Method, rule: &RewriteRule) -> WrapState {
    let interior: Vec<usize> = method
        .interior()
        .filter(|&i| !lines[i].trim().is_empty())
        .collect();
    let (Some(&first), Some(&last)) = (interior.first(), interior.last()) else {
        return WrapState::Unwrapped;
    };

    // A stacked extra closer ends the body early, on the extra line itself
    if redundant_close_at(lines, last, rule).is_some() {
        return WrapState::CorruptedDoubleWrap;
    }

    if first == last || !rule.is_wrap_open(&lines[first]) {
        return WrapState::Unwrapped;
    }

    if stacked_opener_at(lines, first, rule).is_some() {
        return WrapState::CorruptedDoubleWrap;
    }

    if locate_block_end(lines, first) != Ok(last) {
        return WrapState::Unwrapped;
    }

    if rule.is_wrap_close(&lines[last]) {
        WrapState::CanonicalWrap
    } else if rule.is_legacy_close(&lines[last]) {
        WrapState::LegacyWrap
    } else {
        WrapState::Unwrapped
    }
}

/// Where the wrapper lines landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WrapEdit {
    open: Span,
    close: Span,
}

/// Insert the opener after the declaration and the closer before the
/// closing brace, one level deeper than the declaration.
fn wrap_body(
    lines: &mut Vec<String>,
    method: &Method,
    rule: &RewriteRule,
    reindent: bool,
) -> WrapEdit {
    let inner_indent = format!("{}{}", method.indent, method.indent_unit);

    if reindent {
        for line in &mut lines[method.interior()] {
            if !line.trim().is_empty() {
                line.insert_str(0, &method.indent_unit);
            }
        }
    }

    lines.insert(
        method.body.end,
        format!("{}{}", inner_indent, rule.wrap_close),
    );
    lines.insert(
        method.body.start + 1,
        format!("{}{}", inner_indent, rule.wrap_open),
    );

    let open = method.body.start + 1;
    let close = method.body.end + 1;
    WrapEdit {
        open: Span::line(open, SpanKind::WrapperOpen),
        close: Span::line(close, SpanKind::WrapperClose),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Repair Normalizer
// ─────────────────────────────────────────────────────────────────────────────

/// Counts of repair edits
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RepairReport {
    /// Inner wrappers removed from a stacked pair
    openers_collapsed: usize,
    /// Surplus closing lines deleted
    closes_removed: usize,
    /// Legacy closing lines rewritten to the canonical form
    closes_normalized: usize,
}

impl RepairReport {
    fn total(&self) -> usize {
        self.openers_collapsed + self.closes_removed + self.closes_normalized
    }
}

/// Two stacked openers at `i` whose closers are stacked too.
///
/// Returns `(inner_open, inner_close, outer_close)`.
fn stacked_opener_at(
    lines: &[String],
    i: usize,
    rule: &RewriteRule,
) -> Option<(usize, usize, usize)> {
    if !rule.is_wrap_open(&lines[i]) {
        return None;
    }
    let inner = next_non_blank(lines, i + 1)?;
    if !rule.is_wrap_open(&lines[inner]) {
        return None;
    }

    let outer_end = locate_block_end(lines, i).ok()?;
    let inner_end = locate_block_end(lines, inner).ok()?;
    let stacked = next_non_blank(lines, inner_end + 1) == Some(outer_end)
        && rule.is_close_form(&lines[inner_end])
        && rule.is_close_form(&lines[outer_end]);

    stacked.then_some((inner, inner_end, outer_end))
}

/// A closer at `i` stacked on another closer that ends a target method early.
///
/// One of the two must be the legacy closer. The second line is surplus only
/// when walking back from it lands on a declaration the rule matches, i.e. the
/// extra closer took the place of the method's own closing brace. Returns the
/// surplus line.
fn redundant_close_at(lines: &[String], i: usize, rule: &RewriteRule) -> Option<usize> {
    if !rule.is_close_form(&lines[i]) {
        return None;
    }
    let j = next_non_blank(lines, i + 1)?;
    if !rule.is_close_form(&lines[j]) {
        return None;
    }
    if !rule.is_legacy_close(&lines[i]) && !rule.is_legacy_close(&lines[j]) {
        return None;
    }

    let opener = locate_block_start(lines, j)?;
    rule.match_declaration(&lines[opener]).map(|_| j)
}

/// Shift the lines of an inner wrapper back to the outer wrapper's level.
fn outdent_lines(lines: &mut [String], outer: usize, inner: usize, inner_end: usize) {
    let outer_ws = leading_whitespace(&lines[outer]).to_string();
    let inner_ws = leading_whitespace(&lines[inner]).to_string();
    let Some(extra) = inner_ws.strip_prefix(outer_ws.as_str()) else {
        return;
    };
    if extra.is_empty() {
        return;
    }

    let cut = outer_ws.len()..inner_ws.len();
    for line in &mut lines[inner + 1..inner_end] {
        if line.starts_with(inner_ws.as_str()) {
            line.replace_range(cut.clone(), "");
        }
    }
}

/// Collapse known corruption inside one method into the canonical single wrap.
///
/// Only the method's own body is inspected: stacked openers at the first body
/// line, a surplus closer in place of the method's closing brace, and legacy
/// closers up to the method's end. Runs to a fixed point and is a no-op on a
/// canonical body.
fn repair(lines: &mut Vec<String>, method: &Method, rule: &RewriteRule) -> RepairReport {
    let mut report = RepairReport::default();
    let start = method.body.start;

    loop {
        let Ok(end) = locate_block_end(lines, start) else {
            break;
        };

        if let Some(first) = next_non_blank(lines, start + 1).filter(|&i| i < end) {
            if let Some((inner, inner_end, outer_end)) = stacked_opener_at(lines, first, rule) {
                if outer_end < end {
                    outdent_lines(lines, first, inner, inner_end);
                    lines.remove(inner_end);
                    lines.remove(inner);
                    report.openers_collapsed += 1;
                    continue;
                }
            }
        }

        let last = (start + 1..end).rev().find(|&i| !lines[i].trim().is_empty());
        if let Some(j) = last.and_then(|i| redundant_close_at(lines, i, rule)) {
            if j == end {
                lines.remove(j);
                report.closes_removed += 1;
                continue;
            }
        }

        break;
    }

    if let Ok(end) = locate_block_end(lines, start) {
        for line in &mut lines[start + 1..end] {
            if rule.is_legacy_close(line) {
                *line = format!("{}{}", leading_whitespace(line), rule.wrap_close);
                report.closes_normalized += 1;
            }
        }
    }

    report
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Per-file result reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum FileOutcome {
    /// Rewritten; content changed
    Fixed,
    /// Methods found, all already canonical
    Unchanged,
    /// File does not exist
    SkippedMissing,
    /// No declaration matched; content untouched
    SkippedNoMatch,
    /// Some method never closed; the rest was rewritten
    FailedUnbalancedBlock,
    /// Declaration pattern matched inside another method; content untouched
    FailedNestedSignature,
}

impl FileOutcome {
    fn is_failure(self) -> bool {
        matches!(
            self,
            Self::FailedUnbalancedBlock | Self::FailedNestedSignature
        )
    }
}

impl fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Fixed => "fixed",
            Self::Unchanged => "already canonical",
            Self::SkippedMissing => "file not found",
            Self::SkippedNoMatch => "no matching declaration",
            Self::FailedUnbalancedBlock => "unbalanced method body",
            Self::FailedNestedSignature => "nested declaration",
        };
        f.write_str(label)
    }
}

/// What happened while transforming one buffer
#[derive(Debug, Default)]
struct TransformResult {
    stats: Stats,
    /// Declarations (0-based lines) skipped for unbalanced braces
    unbalanced: Vec<usize>,
    /// Set when the buffer was left untouched because of a nested match
    conflict: Option<EngineError>,
}

/// Apply one rule to the buffer. Returns the skipped unbalanced declarations.
fn apply_rule(
    lines: &mut Vec<String>,
    rule: &RewriteRule,
    config: &Config,
    stats: &mut Stats,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<Vec<usize>, EngineError> {
    let mut methods = Vec::new();
    let mut unbalanced = Vec::new();

    for located in find_methods(lines.as_slice(), rule, &config.indent_unit) {
        match located {
            Ok(method) => methods.push(method),
            Err(EngineError::UnbalancedBlock { start }) => {
                if config.verbose {
                    console.print(&styles.warning(format!(
                        "  Skipping declaration on line {}: braces never balance",
                        start + 1
                    )));
                }
                unbalanced.push(start);
            }
            Err(conflict) => return Err(conflict),
        }
    }

    stats.methods_found += methods.len();
    stats.methods_skipped += unbalanced.len();

    if methods.is_empty() && unbalanced.is_empty() {
        return Ok(unbalanced);
    }

    // Bottom-up so that insertions never move a method still to be processed
    for method in methods.iter().rev() {
        let state = classify_body(lines, method, rule);

        if config.verbose {
            console.print(&styles.method(format!(
                "  {}: lines {}-{} ({})",
                method.name,
                method.body.start + 1,
                method.body.end + 1,
                state
            )));
        }

        match state {
            WrapState::Unwrapped => {
                let edit = wrap_body(lines, method, rule, config.reindent);
                stats.methods_wrapped += 1;
                if config.verbose {
                    console.print(&styles.dim(format!(
                        "    Wrapped: {:?} on line {}, {:?} on line {}",
                        edit.open.kind,
                        edit.open.start + 1,
                        edit.close.kind,
                        edit.close.start + 1
                    )));
                }
            }
            WrapState::CanonicalWrap => stats.methods_canonical += 1,
            WrapState::LegacyWrap | WrapState::CorruptedDoubleWrap => {
                let report = repair(lines, method, rule);
                stats.methods_repaired += 1;
                stats.repairs_applied += report.total();
                if config.verbose {
                    console.print(&styles.dim(format!(
                        "    Repaired: {} stacked wrapper(s), {} surplus closer(s), {} legacy closer(s)",
                        report.openers_collapsed, report.closes_removed, report.closes_normalized
                    )));
                }
            }
        }

        let edit = rewrite_signature(lines, method, rule);
        if edit.renamed {
            stats.signatures_renamed += 1;
        }
        if edit.marker_inserted {
            stats.markers_inserted += 1;
        }
    }

    // Also runs when every declaration was unbalanced, so no stale reference
    // survives in a file that is reported as incomplete
    stats.call_sites_renamed += rename_call_sites(lines, rule);

    Ok(unbalanced)
}

/// Main rewrite entry point for one buffer's lines
fn transform_lines(
    lines: Vec<String>,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> (Vec<String>, TransformResult) {
    let start_time = Instant::now();
    let mut result = TransformResult::default();
    result.stats.total_lines = lines.len();

    let mut working = lines.clone();

    for rule in &config.rules {
        if config.verbose {
            console.print(&styles.header(format!(
                "Rule: {} -> {}",
                rule.old_name, rule.new_name
            )));
        }

        match apply_rule(&mut working, rule, config, &mut result.stats, console, styles) {
            Ok(unbalanced) => result.unbalanced.extend(unbalanced),
            Err(conflict) => {
                if config.verbose {
                    console.print(&styles.warning(format!("  {}", conflict)));
                }
                result.conflict = Some(conflict);
                result.stats.elapsed = start_time.elapsed();
                return (lines, result);
            }
        }
    }

    result.stats.elapsed = start_time.elapsed();
    (working, result)
}

/// Result of processing a single file or stdin
#[derive(Debug)]
struct FileResult {
    filename: String,
    original: String,
    rewritten: String,
    outcome: FileOutcome,
    detail: Option<String>,
    stats: Stats,
}

impl FileResult {
    fn missing(filename: String) -> Self {
        Self {
            filename,
            original: String::new(),
            rewritten: String::new(),
            outcome: FileOutcome::SkippedMissing,
            detail: None,
            stats: Stats::default(),
        }
    }

    fn would_change(&self) -> bool {
        self.original != self.rewritten
    }
}

/// Rewrite one text and classify the outcome
fn process_text(
    text: &str,
    filename: String,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> FileResult {
    let buffer = SourceBuffer::parse(text);

    if config.verbose {
        console.print(&styles.bold(format!(
            "Processing {} ({} lines)...",
            filename,
            buffer.lines.len()
        )));
    }

    let SourceBuffer {
        lines,
        ending,
        trailing_newline,
    } = buffer;
    let original = lines.clone();
    let (lines, transform) = transform_lines(lines, config, console, styles);
    // Untouched lines keep the input bytes, mixed line endings included.
    let rewritten = if lines == original {
        text.to_string()
    } else {
        SourceBuffer {
            lines,
            ending,
            trailing_newline,
        }
        .render()
    };

    let (outcome, detail) = if let Some(conflict) = &transform.conflict {
        (FileOutcome::FailedNestedSignature, Some(conflict.to_string()))
    } else if !transform.unbalanced.is_empty() {
        let lines = transform
            .unbalanced
            .iter()
            .map(|l| (l + 1).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        (
            FileOutcome::FailedUnbalancedBlock,
            Some(format!(
                "braces never balance for the declaration(s) on line(s) {}",
                lines
            )),
        )
    } else if transform.stats.methods_found == 0 {
        (FileOutcome::SkippedNoMatch, None)
    } else if rewritten != text {
        (FileOutcome::Fixed, None)
    } else {
        (FileOutcome::Unchanged, None)
    };

    FileResult {
        filename,
        original: text.to_string(),
        rewritten,
        outcome,
        detail,
        stats: transform.stats,
    }
}

/// Read and rewrite one file; a missing file is an outcome, not an error
fn process_path(
    path: &Path,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<FileResult> {
    if let Err(err) = fs::metadata(path) {
        if err.kind() == io::ErrorKind::NotFound {
            return Ok(FileResult::missing(path.display().to_string()));
        }
    }

    let text = read_file(path)?;
    Ok(process_text(
        &text,
        path.display().to_string(),
        config,
        console,
        styles,
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Input Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Read a list of file names, one per line
fn read_file_list(path: &Path) -> Result<Vec<PathBuf>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file list: {}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}

/// Resolve CLI names and listed names against the base directory, in order
fn resolve_inputs(
    args: &Args,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<Vec<PathBuf>> {
    let mut names = args.inputs.clone();
    if let Some(ref list) = args.files_from {
        names.extend(read_file_list(list)?);
    }

    let resolved: Vec<PathBuf> = names
        .into_iter()
        .map(|name| match &config.base_dir {
            Some(base) if name.is_relative() => base.join(name),
            _ => name,
        })
        .collect();

    if config.recursive {
        discover_recursive_files(&resolved, config, console, styles)
    } else {
        Ok(resolved)
    }
}

fn build_globset(patterns: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut added = 0;

    for raw in patterns.split(',') {
        let pattern = raw.trim();
        if pattern.is_empty() {
            continue;
        }

        let glob = Glob::new(pattern)
            .map_err(|err| ArgError(format!("Invalid glob pattern '{}': {}", pattern, err)))?;
        builder.add(glob);
        added += 1;
    }

    if added == 0 {
        return Err(ArgError("--glob must include at least one pattern".to_string()).into());
    }

    builder
        .build()
        .map_err(|err| ArgError(format!("Invalid glob set: {}", err)).into())
}

fn discover_recursive_files(
    paths: &[PathBuf],
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<Vec<PathBuf>> {
    let globs = build_globset(&config.glob)?;
    let mut files = std::collections::BTreeSet::new();

    for path in paths {
        if path.is_file() {
            files.insert(path.clone());
            continue;
        }

        if !path.is_dir() {
            if config.verbose {
                console.print(&styles.dim(format!(
                    "Warning: path does not exist: {}",
                    path.display()
                )));
            }
            continue;
        }

        let mut walker = WalkBuilder::new(path);
        walker.git_ignore(config.gitignore);
        walker.git_exclude(config.gitignore);
        walker.git_global(config.gitignore);
        walker.ignore(config.gitignore);
        walker.hidden(false);

        if config.max_depth > 0 {
            walker.max_depth(Some(config.max_depth));
        }

        for entry in walker.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if config.verbose {
                        console.print(&styles.dim(format!("Warning: {}", err)));
                    }
                    continue;
                }
            };

            let entry_path = entry.path();
            if !entry_path.is_file() {
                continue;
            }
            if entry_path
                .file_name()
                .is_some_and(|name| globs.is_match(name))
            {
                files.insert(entry_path.to_path_buf());
            }
        }
    }

    Ok(files.into_iter().collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// File I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Copy the file to `<path><ext>` (e.g. "page.dart" becomes "page.dart.bak")
fn create_backup(path: &Path, ext: &str) -> Result<PathBuf> {
    let mut backup_name = path.as_os_str().to_owned();
    backup_name.push(ext);
    let backup_path = PathBuf::from(backup_name);

    fs::copy(path, &backup_path)
        .with_context(|| format!("Failed to create backup at {}", backup_path.display()))?;

    Ok(backup_path)
}

/// Maximum file size (100 MB) - reject larger files to prevent memory issues
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Read a whole source file as UTF-8 text
fn read_file(path: &Path) -> Result<String> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read file metadata: {}", path.display()))?;

    if metadata.len() > MAX_FILE_SIZE {
        return Err(ParseError(format!(
            "File too large: {} ({} MB). Maximum supported size is {} MB.",
            path.display(),
            metadata.len() / (1024 * 1024),
            MAX_FILE_SIZE / (1024 * 1024)
        ))
        .into());
    }

    let bytes =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;

    decode_text(bytes, &path.display().to_string())
}

/// Read all of stdin as UTF-8 text
fn read_stdin_text() -> Result<String> {
    let mut buf = Vec::new();
    io::stdin()
        .read_to_end(&mut buf)
        .context("Failed to read stdin")?;
    decode_text(buf, "stdin")
}

/// Reject binary content and invalid UTF-8
fn decode_text(bytes: Vec<u8>, source_label: &str) -> Result<String> {
    if bytes.contains(&0) {
        return Err(ParseError(format!("Input appears to be binary: {}", source_label)).into());
    }

    String::from_utf8(bytes).map_err(|err| {
        let valid_up_to = err.utf8_error().valid_up_to();
        let detail = match err.as_bytes().get(valid_up_to) {
            Some(b) => format!(
                "Invalid UTF-8 at byte position {} (byte value: 0x{:02X}) in {}",
                valid_up_to, b, source_label
            ),
            None => format!("Invalid UTF-8 in {}", source_label),
        };
        ParseError(detail).into()
    })
}

/// Write the rewritten text back, with an optional backup first
fn write_result(
    path: &Path,
    result: &FileResult,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<()> {
    if config.backup {
        let backup_path = create_backup(path, &config.backup_ext)?;
        if config.verbose {
            console.print(&styles.dim(format!("Created backup: {}", backup_path.display())));
        }
    }

    fs::write(path, &result.rewritten)
        .with_context(|| format!("Failed to write to file: {}", path.display()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonOutput {
    version: &'static str,
    status: &'static str,
    file: String,
    outcome: FileOutcome,
    detail: Option<String>,
    input: InputStats,
    rewrite: RewriteStats,
    output: OutputStats,
    content: Option<String>,
}

#[derive(Serialize)]
struct InputStats {
    lines: usize,
    bytes: usize,
}

#[derive(Serialize)]
struct RewriteStats {
    methods_found: usize,
    methods_wrapped: usize,
    methods_canonical: usize,
    methods_repaired: usize,
    methods_skipped: usize,
    signatures_renamed: usize,
    markers_inserted: usize,
    call_sites_renamed: usize,
    repairs_applied: usize,
}

#[derive(Serialize)]
struct OutputStats {
    lines: usize,
    bytes: usize,
    changed: bool,
}

/// Output JSON for a single file result
fn output_json(config: &Config, result: &FileResult, include_content: bool) -> Result<()> {
    let stats = &result.stats;
    let json_output = JsonOutput {
        version: "1.0",
        status: if config.dry_run { "dry_run" } else { "success" },
        file: result.filename.clone(),
        outcome: result.outcome,
        detail: result.detail.clone(),
        input: InputStats {
            lines: result.original.lines().count(),
            bytes: result.original.len(),
        },
        rewrite: RewriteStats {
            methods_found: stats.methods_found,
            methods_wrapped: stats.methods_wrapped,
            methods_canonical: stats.methods_canonical,
            methods_repaired: stats.methods_repaired,
            methods_skipped: stats.methods_skipped,
            signatures_renamed: stats.signatures_renamed,
            markers_inserted: stats.markers_inserted,
            call_sites_renamed: stats.call_sites_renamed,
            repairs_applied: stats.repairs_applied,
        },
        output: OutputStats {
            lines: result.rewritten.lines().count(),
            bytes: result.rewritten.len(),
            changed: result.would_change(),
        },
        content: if include_content && !config.dry_run {
            Some(result.rewritten.clone())
        } else {
            None
        },
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json_output).context("Failed to serialize JSON output")?
    );

    Ok(())
}

/// Output a unified diff for a file result
fn output_diff(result: &FileResult, proposed: bool) -> Result<()> {
    if !result.would_change() {
        return Ok(());
    }

    let diff = TextDiff::from_lines(&result.original, &result.rewritten);
    let mut stdout = io::stdout().lock();

    writeln!(stdout, "--- a/{}", result.filename)?;
    if proposed {
        writeln!(stdout, "+++ b/{} (proposed)", result.filename)?;
    } else {
        writeln!(stdout, "+++ b/{}", result.filename)?;
    }

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        writeln!(stdout, "{}", hunk.header())?;
        for change in hunk.iter_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => " ",
            };
            let line = change.value();
            if line.ends_with('\n') {
                write!(stdout, "{}{}", sign, line)?;
            } else {
                writeln!(stdout, "{}{}", sign, line)?;
            }
        }
    }

    Ok(())
}

/// Output dry-run info for a single file
fn output_dry_run(
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
    result: &FileResult,
) -> Result<()> {
    if config.diff {
        output_diff(result, true)?;
    }

    if config.verbose {
        if result.would_change() {
            console.print(&styles.method(format!("Would rewrite: {}", result.filename)));
            console.print(&styles.dim(format!(
                "  {} wrapped, {} repaired, {} call site(s)",
                result.stats.methods_wrapped,
                result.stats.methods_repaired,
                result.stats.call_sites_renamed
            )));
        } else {
            console.print(&styles.success(format!("No changes needed: {}", result.filename)));
        }
    }

    Ok(())
}

/// Report the per-file outcome: failures always, the rest in verbose mode
fn report_outcome(
    result: &FileResult,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) {
    match result.outcome {
        FileOutcome::SkippedMissing => {
            if !config.json {
                eprintln!("Skipping {}: file not found", result.filename);
            }
        }
        FileOutcome::FailedUnbalancedBlock | FileOutcome::FailedNestedSignature => {
            eprintln!(
                "{}: {}: {}",
                result.filename,
                result.outcome,
                result.detail.as_deref().unwrap_or("")
            );
        }
        FileOutcome::Fixed => {
            if config.verbose {
                console.print(&styles.success(format!(
                    "{}: {} ({} wrapped, {} repaired, {} call site(s))",
                    result.filename,
                    result.outcome,
                    result.stats.methods_wrapped,
                    result.stats.methods_repaired,
                    result.stats.call_sites_renamed
                )));
            }
        }
        FileOutcome::Unchanged | FileOutcome::SkippedNoMatch => {
            if config.verbose {
                console.print(&styles.dim(format!("{}: {}", result.filename, result.outcome)));
            }
        }
    }
}

/// Emit one file's result in the configured mode, writing it when allowed
fn emit_file_result(
    path: &Path,
    result: &FileResult,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<()> {
    report_outcome(result, config, console, styles);

    if config.json {
        output_json(config, result, false)?;
    } else if config.dry_run {
        output_dry_run(config, console, styles, result)?;
    } else if config.diff {
        output_diff(result, false)?;
    }

    if !config.dry_run && !config.diff && result.would_change() {
        write_result(path, result, config, console, styles)?;
    }

    Ok(())
}

/// Rewrite every file in order; per-file failures never stop the batch
fn process_batch(
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
    paths: &[PathBuf],
) -> Result<RunOutcome> {
    let mut tally = OutcomeTally::default();
    let mut aggregated_stats = Stats::default();
    let mut any_would_change = false;
    let mut incomplete = false;
    let mut errors: Vec<(PathBuf, anyhow::Error)> = Vec::new();

    for path in paths {
        let handled = process_path(path, config, console, styles).and_then(|result| {
            emit_file_result(path, &result, config, console, styles)?;
            Ok(result)
        });

        match handled {
            Ok(result) => {
                tally.record(result.outcome);
                aggregated_stats.merge(&result.stats);
                any_would_change |= result.would_change();
                incomplete |= result.outcome.is_failure();
            }
            Err(e) => {
                eprintln!("Error processing {}: {:#}", path.display(), e);
                errors.push((path.clone(), e));
            }
        }
    }

    if config.verbose {
        print_stats_summary(&aggregated_stats, &tally, errors.len(), console, styles);
    }

    if !errors.is_empty() {
        let files = errors
            .iter()
            .map(|(p, _)| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let has_parse_error = errors
            .iter()
            .any(|(_, err)| error_chain_has::<ParseError>(err));

        if has_parse_error {
            return Err(ParseError(format!(
                "{} file(s) had parse errors: {}",
                errors.len(),
                files
            ))
            .into());
        }

        anyhow::bail!("{} file(s) had errors: {}", errors.len(), files);
    }

    Ok(RunOutcome {
        dry_run: config.dry_run,
        would_change: any_would_change,
        incomplete,
    })
}

/// Handle output for stdin input
fn output_stdin_result(
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
    result: &FileResult,
) -> Result<RunOutcome> {
    report_outcome(result, config, console, styles);

    if config.json {
        output_json(config, result, true)?;
    } else if config.dry_run {
        output_dry_run(config, console, styles, result)?;
    } else if config.diff {
        output_diff(result, false)?;
    } else {
        let mut stdout = io::stdout().lock();
        stdout.write_all(result.rewritten.as_bytes())?;
        stdout.flush()?;
    }

    if config.verbose {
        let mut tally = OutcomeTally::default();
        tally.record(result.outcome);
        print_stats_summary(&result.stats, &tally, 0, console, styles);
    }

    Ok(RunOutcome {
        dry_run: config.dry_run,
        would_change: result.would_change(),
        incomplete: result.outcome.is_failure(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Watch Mode
// ─────────────────────────────────────────────────────────────────────────────

/// What the watch loop has seen since it started
#[derive(Debug, Default)]
struct WatchTally {
    any_changes: bool,
    incomplete: bool,
}

impl WatchTally {
    fn record(&mut self, result: &FileResult, written: bool) {
        self.any_changes |= written;
        self.incomplete |= result.outcome.is_failure();
    }

    fn into_outcome(self) -> RunOutcome {
        RunOutcome {
            dry_run: false,
            would_change: self.any_changes,
            incomplete: self.incomplete,
        }
    }
}

/// Rewrite one watched file; returns the result and whether it was written
fn rewrite_watched_file(
    path: &Path,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<(FileResult, bool)> {
    let result = process_path(path, config, console, styles)?;
    report_outcome(&result, config, console, styles);

    if !result.would_change() {
        eprintln!("✓ {}: no changes needed", result.filename);
        return Ok((result, false));
    }

    write_result(path, &result, config, console, styles)?;
    eprintln!(
        "✓ {}: wrapped {}, repaired {}, renamed {} call site(s)",
        result.filename,
        result.stats.methods_wrapped,
        result.stats.methods_repaired,
        result.stats.call_sites_renamed
    );
    Ok((result, true))
}

/// Watch the files and rewrite each one whenever it is saved.
///
/// The tool's own write fires another event; the rewrite is idempotent, so
/// that event reports "no changes needed".
fn watch_and_rewrite(
    paths: &[PathBuf],
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<RunOutcome> {
    let mut watched = Vec::with_capacity(paths.len());
    for path in paths {
        if !path.is_file() {
            anyhow::bail!("--watch requires existing files: {}", path.display());
        }
        watched.push(
            fs::canonicalize(path)
                .with_context(|| format!("Failed to resolve path: {}", path.display()))?,
        );
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let (tx, rx) = mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    )
    .context("Failed to create file watcher")?;

    for path in &watched {
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch file: {}", path.display()))?;
    }

    let debounce = Duration::from_millis(config.debounce_ms);
    let mut last_event = Instant::now()
        .checked_sub(debounce)
        .unwrap_or_else(Instant::now);

    eprintln!(
        "Watching {} file(s) for changes (Ctrl+C to stop)...",
        watched.len()
    );

    let mut tally = WatchTally::default();

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                let now = Instant::now();
                if now.duration_since(last_event) < debounce {
                    continue;
                }
                last_event = now;

                for changed in &event.paths {
                    let Ok(changed) = fs::canonicalize(changed) else {
                        continue;
                    };
                    if !watched.contains(&changed) {
                        continue;
                    }

                    match rewrite_watched_file(&changed, config, console, styles) {
                        Ok((result, written)) => tally.record(&result, written),
                        Err(e) => eprintln!("✗ {}: {:#}", changed.display(), e),
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    eprintln!("\nWatch mode stopped.");

    Ok(tally.into_outcome())
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::SUCCESS,
                _ => exit_codes::INVALID_ARGS,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Some(Commands::Config { action }) = &args.command {
        let exit_code = match run_config_command(action) {
            Ok(()) => exit_codes::SUCCESS,
            Err(err) => {
                eprintln!("Error: {:#}", err);
                exit_code_for_error(&err)
            }
        };
        std::process::exit(exit_code);
    }

    let exit_code = match run(args) {
        Ok(outcome) => outcome.exit_code(),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for_error(&err)
        }
    };

    std::process::exit(exit_code);
}

fn run(args: Args) -> Result<RunOutcome> {
    validate_args(&args)?;

    let config = create_config(&args)?;
    let (console, styles) = build_console(config.color);

    if config.verbose {
        for rule in &config.rules {
            console.print(&styles.dim(format!(
                "Rule {} -> {} (declaration '{}', wrapper '{}' ... '{}')",
                rule.old_name, rule.new_name, rule.declaration, rule.wrap_open, rule.wrap_close
            )));
        }
    }

    if args.inputs.is_empty() && args.files_from.is_none() {
        let text = read_stdin_text()?;
        let result = process_text(&text, "stdin".to_string(), &config, &console, &styles);
        return output_stdin_result(&config, &console, &styles, &result);
    }

    let paths = resolve_inputs(&args, &config, &console, &styles)?;

    if config.watch {
        return watch_and_rewrite(&paths, &config, &console, &styles);
    }

    if paths.is_empty() {
        let message = if config.recursive {
            format!(
                "Warning: No files matched pattern '{}' in provided paths",
                config.glob
            )
        } else {
            "Warning: No input files listed".to_string()
        };
        if config.verbose {
            console.print(&styles.dim(message));
        } else {
            eprintln!("{}", message);
        }
        return Ok(RunOutcome {
            dry_run: config.dry_run,
            ..RunOutcome::default()
        });
    }

    process_batch(&config, &console, &styles, &paths)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
