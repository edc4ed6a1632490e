//! E2E Integration tests for scopewrap
//!
//! Run with: cargo test --test integration
//! Verbose:  TEST_VERBOSE=1 cargo test --test integration -- --nocapture

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

/// Test logging macro - prints when TEST_VERBOSE is set
macro_rules! test_log {
    ($level:expr, $($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            eprintln!("[{}] [integration:{}] {}",
                $level,
                line!(),
                format!($($arg)*)
            );
        }
    };
}

fn get_binary_path() -> PathBuf {
    if let Ok(bin_path) = std::env::var("CARGO_BIN_EXE_scopewrap") {
        let path = PathBuf::from(bin_path);
        if path.exists() {
            return path;
        }
    }

    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let release_path = PathBuf::from(manifest_dir).join("target/release/scopewrap");
    let debug_path = PathBuf::from(manifest_dir).join("target/debug/scopewrap");

    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        let custom_release = PathBuf::from(&target_dir).join("release/scopewrap");
        let custom_debug = PathBuf::from(&target_dir).join("debug/scopewrap");
        if custom_release.exists() {
            return custom_release;
        }
        if custom_debug.exists() {
            return custom_debug;
        }
    }

    if release_path.exists() {
        release_path
    } else if debug_path.exists() {
        debug_path
    } else {
        panic!(
            "scopewrap binary not found. Run 'cargo build' or 'cargo build --release' first.\n\
             Looked in:\n  - {}\n  - {}",
            release_path.display(),
            debug_path.display()
        );
    }
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/dart")
        .join(name)
}

/// Copy a fixture into a temp dir so the tool may rewrite it in place
fn stage_fixture(dir: &Path, name: &str) -> PathBuf {
    let target = dir.join(name);
    fs::copy(fixture(name), &target).expect("Failed to copy fixture");
    target
}

fn run_scopewrap_stdin(input: &str, args: &[&str]) -> (String, String, i32) {
    test_log!("RUN", "scopewrap with args: {:?}", args);
    test_log!("INPUT", "Input length: {} bytes", input.len());

    let binary = get_binary_path();
    test_log!("BIN", "Using binary: {}", binary.display());

    let mut child = Command::new(&binary)
        .arg("--no-config")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn scopewrap");

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .expect("Failed to write to stdin");
    }

    let output = child
        .wait_with_output()
        .expect("Failed to wait on scopewrap");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    test_log!("OUTPUT", "Exit code: {}", code);
    test_log!("OUTPUT", "Stdout length: {} bytes", stdout.len());
    if !stderr.is_empty() {
        test_log!("STDERR", "{}", stderr);
    }

    (stdout, stderr, code)
}

fn run_scopewrap_args(args: &[&str]) -> (String, String, i32) {
    test_log!("RUN", "scopewrap with args: {:?}", args);

    let binary = get_binary_path();
    let output = Command::new(&binary)
        .args(args)
        .output()
        .expect("Failed to run scopewrap");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    test_log!("OUTPUT", "Exit code: {}", code);
    if !stderr.is_empty() {
        test_log!("STDERR", "{}", stderr);
    }

    (stdout, stderr, code)
}

fn run_scopewrap_file(file_path: &Path, args: &[&str]) -> (String, String, i32) {
    let path = file_path.to_str().expect("Temp path is not UTF-8");
    let mut cmd_args = vec!["--no-config"];
    cmd_args.extend_from_slice(args);
    cmd_args.push(path);
    run_scopewrap_args(&cmd_args)
}

const SCENARIO_INPUT: &str = "void _generateQuestion() {
  score = score + 1;
}
";

const SCENARIO_OUTPUT: &str = "@override
void generateNewQuestion() {
  setState(() {
    score = score + 1;
  });
}
";

// ============================================================================
// Basic Functionality Tests
// ============================================================================

#[test]
fn test_e2e_scenario_from_stdin() {
    test_log!("START", "Rename, mark and wrap a single method");

    let (stdout, _stderr, code) = run_scopewrap_stdin(SCENARIO_INPUT, &[]);

    assert_eq!(code, 0, "Should exit successfully");
    assert_eq!(stdout, SCENARIO_OUTPUT, "Output should match expected");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_second_run_is_byte_identical() {
    test_log!("START", "Idempotence on stdin");

    let (once, _stderr, code) = run_scopewrap_stdin(SCENARIO_INPUT, &[]);
    assert_eq!(code, 0);

    let (twice, _stderr, code) = run_scopewrap_stdin(&once, &[]);
    assert_eq!(code, 0);
    assert_eq!(twice, once, "Second run must not change anything");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_non_matching_input_passes_through() {
    test_log!("START", "Non-interference");

    let input = "class A {\n  void build() {\n    helper();\n  }\n}\n";
    let (stdout, _stderr, code) = run_scopewrap_stdin(input, &[]);

    assert_eq!(code, 0);
    assert_eq!(stdout, input, "Unmatched input must be byte-identical");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_empty_input() {
    test_log!("START", "Empty input handling");

    let (stdout, _stderr, code) = run_scopewrap_stdin("", &[]);

    assert_eq!(code, 0, "Should handle empty input");
    assert!(stdout.is_empty(), "Empty input should give empty output");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_custom_rule_from_flags() {
    test_log!("START", "Custom rename and wrapper via CLI flags");

    let input = "  Future<void> _load() async {\n    await fetch();\n  }\n";
    let (stdout, _stderr, code) = run_scopewrap_stdin(
        input,
        &[
            "--from",
            "_load",
            "--to",
            "load",
            "--declaration",
            "Future<void> {name}() async",
            "--no-marker",
            "--wrap-open",
            "runInAction(() {",
        ],
    );

    assert_eq!(code, 0);
    assert_eq!(
        stdout,
        "  Future<void> load() async {\n    runInAction(() {\n      await fetch();\n    });\n  }\n"
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_verbose_mode() {
    test_log!("START", "Verbose output goes to stderr");

    let (stdout, stderr, code) =
        run_scopewrap_stdin(SCENARIO_INPUT, &["-v", "--color", "never"]);

    assert_eq!(code, 0);
    assert!(stdout.contains("void generateNewQuestion() {"));
    let combined = format!("{}{}", stdout, stderr);
    assert!(
        combined.contains("Summary"),
        "Verbose mode should print a summary"
    );
    assert!(
        combined.contains("_generateQuestion: lines 1-3 (unwrapped)"),
        "Verbose mode should describe the located method"
    );

    test_log!("END", "Test PASSED");
}

// ============================================================================
// File Mode Tests
// ============================================================================

#[test]
fn test_e2e_fixture_rewritten_in_place() {
    test_log!("START", "Activity file is rewritten in place");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = stage_fixture(dir.path(), "counting_activity.dart");

    let (stdout, _stderr, code) = run_scopewrap_file(&target, &[]);

    assert_eq!(code, 0);
    assert!(stdout.is_empty(), "File mode writes nothing to stdout");
    let expected = fs::read_to_string(fixture("counting_activity.expected.dart")).unwrap();
    assert_eq!(fs::read_to_string(&target).unwrap(), expected);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_legacy_corruption_repaired() {
    test_log!("START", "Double-wrap corruption converges on the canonical form");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = stage_fixture(dir.path(), "color_match_legacy.dart");

    let (_stdout, _stderr, code) = run_scopewrap_file(&target, &[]);
    assert_eq!(code, 0);

    let expected = fs::read_to_string(fixture("color_match_legacy.expected.dart")).unwrap();
    let repaired = fs::read_to_string(&target).unwrap();
    assert_eq!(repaired, expected);

    let (_stdout, _stderr, code) = run_scopewrap_file(&target, &["-n"]);
    assert_eq!(code, 0, "Repaired file needs no further changes");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_unrelated_file_untouched() {
    test_log!("START", "File without the target method keeps its bytes");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = stage_fixture(dir.path(), "settings_page.dart");
    let before = fs::read(&target).unwrap();

    let (_stdout, _stderr, code) = run_scopewrap_file(&target, &[]);

    assert_eq!(code, 0);
    assert_eq!(fs::read(&target).unwrap(), before);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_missing_file_is_skipped() {
    test_log!("START", "Missing file is reported and the batch continues");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let present = dir.path().join("quiz.dart");
    fs::write(&present, SCENARIO_INPUT).unwrap();
    let missing = dir.path().join("maze.dart");

    let (_stdout, stderr, code) = run_scopewrap_args(&[
        "--no-config",
        missing.to_str().unwrap(),
        present.to_str().unwrap(),
    ]);

    assert_eq!(code, 0, "Missing files are not errors");
    assert!(stderr.contains("file not found"), "Should mention the skip");
    assert_eq!(fs::read_to_string(&present).unwrap(), SCENARIO_OUTPUT);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_base_dir_and_files_from() {
    test_log!("START", "File list resolved against --base-dir");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let activities = dir.path().join("lib/activities");
    fs::create_dir_all(&activities).unwrap();
    fs::write(activities.join("quiz.dart"), SCENARIO_INPUT).unwrap();
    fs::write(activities.join("maze.dart"), SCENARIO_INPUT).unwrap();

    let list = dir.path().join("targets.txt");
    fs::write(&list, "# activities to migrate\nquiz.dart\nmaze.dart\nshapes.dart\n").unwrap();

    let (_stdout, stderr, code) = run_scopewrap_args(&[
        "--no-config",
        "-C",
        activities.to_str().unwrap(),
        "--files-from",
        list.to_str().unwrap(),
    ]);

    assert_eq!(code, 0);
    assert!(stderr.contains("shapes.dart"), "Missing entry is reported");
    for name in ["quiz.dart", "maze.dart"] {
        assert_eq!(
            fs::read_to_string(activities.join(name)).unwrap(),
            SCENARIO_OUTPUT,
            "{} should be rewritten",
            name
        );
    }

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_recursive_discovery() {
    test_log!("START", "Recursive mode rewrites matching files only");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let nested = dir.path().join("lib/ui");
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("quiz.dart"), SCENARIO_INPUT).unwrap();
    fs::write(nested.join("notes.txt"), SCENARIO_INPUT).unwrap();

    let (_stdout, _stderr, code) =
        run_scopewrap_args(&["--no-config", "-r", dir.path().to_str().unwrap()]);

    assert_eq!(code, 0);
    assert_eq!(
        fs::read_to_string(nested.join("quiz.dart")).unwrap(),
        SCENARIO_OUTPUT
    );
    assert_eq!(
        fs::read_to_string(nested.join("notes.txt")).unwrap(),
        SCENARIO_INPUT,
        "Files outside the glob are left alone"
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_backup_created() {
    test_log!("START", "Backup file keeps the original text");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = dir.path().join("quiz.dart");
    fs::write(&target, SCENARIO_INPUT).unwrap();

    let (_stdout, _stderr, code) =
        run_scopewrap_file(&target, &["--backup", "--backup-ext", ".orig"]);

    assert_eq!(code, 0);
    assert_eq!(
        fs::read_to_string(dir.path().join("quiz.dart.orig")).unwrap(),
        SCENARIO_INPUT
    );
    assert_eq!(fs::read_to_string(&target).unwrap(), SCENARIO_OUTPUT);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_crlf_line_endings_preserved() {
    test_log!("START", "CRLF input keeps CRLF");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = dir.path().join("quiz.dart");
    fs::write(&target, SCENARIO_INPUT.replace('\n', "\r\n")).unwrap();

    let (_stdout, _stderr, code) = run_scopewrap_file(&target, &[]);

    assert_eq!(code, 0);
    assert_eq!(
        fs::read_to_string(&target).unwrap(),
        SCENARIO_OUTPUT.replace('\n', "\r\n")
    );

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Config File Tests
// ============================================================================

#[test]
fn test_e2e_config_file_rules() {
    test_log!("START", "Rules come from the config file");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let rc = dir.path().join(".scopewraprc");
    fs::write(
        &rc,
        "[[rule]]\nfrom = \"_shuffle\"\nto = \"shuffle\"\nmarker = \"\"\n",
    )
    .unwrap();
    let target = dir.path().join("cards.dart");
    fs::write(&target, "void _shuffle() {\n  cards.shuffle();\n}\n").unwrap();

    let (_stdout, _stderr, code) = run_scopewrap_args(&[
        "--config",
        rc.to_str().unwrap(),
        target.to_str().unwrap(),
    ]);

    assert_eq!(code, 0);
    assert_eq!(
        fs::read_to_string(&target).unwrap(),
        "void shuffle() {\n  setState(() {\n    cards.shuffle();\n  });\n}\n"
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_invalid_config_file() {
    test_log!("START", "Broken config file is a general error");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let rc = dir.path().join(".scopewraprc");
    fs::write(&rc, "indent_unit = \"wide\"\n").unwrap();

    let (_stdout, stderr, code) =
        run_scopewrap_args(&["--config", rc.to_str().unwrap(), "x.dart"]);

    assert_eq!(code, 1);
    assert!(stderr.contains("Failed to parse config file"));

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn test_e2e_exit_code_dry_run_no_changes() {
    test_log!("START", "Exit code 0 on dry-run when nothing changes");

    let (_stdout, _stderr, code) = run_scopewrap_stdin(SCENARIO_OUTPUT, &["-n"]);
    assert_eq!(code, 0, "Should return 0 when no changes needed");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_exit_code_dry_run_would_change() {
    test_log!("START", "Exit code 3 on dry-run when changes would be made");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = dir.path().join("quiz.dart");
    fs::write(&target, SCENARIO_INPUT).unwrap();

    let (_stdout, _stderr, code) = run_scopewrap_file(&target, &["-n"]);

    assert_eq!(code, 3, "Should return 3 (WOULD_CHANGE) when changes needed");
    assert_eq!(
        fs::read_to_string(&target).unwrap(),
        SCENARIO_INPUT,
        "Dry run must not write"
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_exit_code_unbalanced_method() {
    test_log!("START", "Exit code 5 when a method never closes");

    let input = "void _generateQuestion() {\n  if (ready) {\n    start();\n";
    let (_stdout, stderr, code) = run_scopewrap_stdin(input, &[]);

    assert_eq!(code, 5, "Should return 5 (INCOMPLETE)");
    assert!(stderr.contains("unbalanced"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_exit_code_nested_declaration() {
    test_log!("START", "Exit code 5 and untouched file on nested declaration");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = dir.path().join("nested.dart");
    let text = "void _generateQuestion() {\n  void generateNewQuestion() {\n  }\n}\n";
    fs::write(&target, text).unwrap();

    let (_stdout, stderr, code) = run_scopewrap_file(&target, &[]);

    assert_eq!(code, 5);
    assert!(stderr.contains("nested declaration"));
    assert_eq!(fs::read_to_string(&target).unwrap(), text);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_exit_code_invalid_args() {
    test_log!("START", "Exit code 2 for invalid arguments");

    let (_stdout, _stderr, code) = run_scopewrap_args(&["--indent-unit", "0", "x.dart"]);
    assert_eq!(code, 2, "Should return 2 (INVALID_ARGS)");

    let (_stdout, _stderr, code) = run_scopewrap_args(&["--from", "_a"]);
    assert_eq!(code, 2, "--from without --to is rejected");

    let (_stdout, _stderr, code) = run_scopewrap_stdin("", &["--declaration", "void run()"]);
    assert_eq!(code, 2, "Template without {{name}} is rejected");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_exit_code_binary_input() {
    test_log!("START", "Exit code 4 for binary input");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = dir.path().join("blob.dart");
    fs::write(&target, [0x00, 0x01, 0x02]).unwrap();

    let (_stdout, _stderr, code) = run_scopewrap_file(&target, &[]);
    assert_eq!(code, 4, "Should return 4 (PARSE_ERROR)");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_exit_code_invalid_utf8() {
    test_log!("START", "Exit code 4 for invalid UTF-8");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = dir.path().join("latin1.dart");
    fs::write(&target, [0xff, 0xfe]).unwrap();

    let (_stdout, _stderr, code) = run_scopewrap_file(&target, &[]);
    assert_eq!(code, 4, "Should return 4 (PARSE_ERROR) for invalid UTF-8");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_help_exits_zero() {
    let (stdout, _stderr, code) = run_scopewrap_args(&["--help"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("EXIT CODES"));
}

// ============================================================================
// Diff and JSON Output Tests
// ============================================================================

#[test]
fn test_e2e_diff_mode_with_changes() {
    test_log!("START", "Diff mode shows the rewrite without writing");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = dir.path().join("quiz.dart");
    fs::write(&target, SCENARIO_INPUT).unwrap();

    let (stdout, _stderr, code) = run_scopewrap_file(&target, &["-d"]);

    assert_eq!(code, 0);
    assert!(stdout.contains("--- a/"), "Should have diff header");
    assert!(stdout.contains("+@override"));
    assert!(stdout.contains("-void _generateQuestion() {"));
    assert!(stdout.contains("+  setState(() {"));
    assert_eq!(fs::read_to_string(&target).unwrap(), SCENARIO_INPUT);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_diff_mode_no_changes() {
    test_log!("START", "Diff mode prints nothing for canonical input");

    let (stdout, _stderr, code) = run_scopewrap_stdin(SCENARIO_OUTPUT, &["-d"]);

    assert_eq!(code, 0);
    assert!(stdout.is_empty());

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_json_output() {
    test_log!("START", "JSON output carries outcome and stats");

    let (stdout, _stderr, code) = run_scopewrap_stdin(SCENARIO_INPUT, &["--json"]);
    assert_eq!(code, 0);

    let value: serde_json::Value = serde_json::from_str(&stdout).expect("Valid JSON");
    assert_eq!(value["outcome"], "fixed");
    assert_eq!(value["rewrite"]["methods_wrapped"], 1);
    assert_eq!(value["rewrite"]["markers_inserted"], 1);
    assert_eq!(value["output"]["changed"], true);
    assert_eq!(value["content"], SCENARIO_OUTPUT);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_json_output_per_file() {
    test_log!("START", "JSON mode emits one document per file");

    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = dir.path().join("quiz.dart");
    fs::write(&target, SCENARIO_INPUT).unwrap();
    let missing = dir.path().join("maze.dart");

    let (stdout, _stderr, code) = run_scopewrap_args(&[
        "--no-config",
        "--json",
        "-n",
        target.to_str().unwrap(),
        missing.to_str().unwrap(),
    ]);

    assert_eq!(code, 3);
    let outcomes: Vec<String> = serde_json::Deserializer::from_str(&stdout)
        .into_iter::<serde_json::Value>()
        .map(|v| v.expect("Valid JSON")["outcome"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(outcomes, vec!["fixed", "skipped_missing"]);

    test_log!("END", "Test PASSED");
}
