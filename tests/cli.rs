use std::path::Path;
use std::process::{Command, Output};

fn lumen(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_lumen"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .env_remove("VOYAGE_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .output()
        .unwrap()
}

fn write_config(dir: &Path, store_type: &str) {
    let config = format!(
        "[embedding]\ndimension = 4\n\n[store]\nstore_type = \"{store_type}\"\npersist_location = \"index\"\n"
    );
    std::fs::write(dir.join(".lumen.toml"), config).unwrap();
}

#[test]
fn init_writes_a_loadable_config() {
    let dir = tempfile::tempdir().unwrap();
    let output = lumen(dir.path(), &["init"]);
    assert!(output.status.success(), "lumen init failed: {}", String::from_utf8_lossy(&output.stderr));

    let content = std::fs::read_to_string(dir.path().join(".lumen.toml")).unwrap();
    assert!(content.contains("[embedding]"));
    assert!(content.contains("[query]"));

    let config = lumen_core::LumenConfig::from_toml(&content).unwrap();
    config.validate().unwrap();
    assert_eq!(config.query.max_results, 10);
}

#[test]
fn init_refuses_if_exists() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".lumen.toml"), "# existing").unwrap();
    assert!(!lumen(dir.path(), &["init"]).status.success());
}

#[test]
fn stats_on_fresh_index_is_empty() {
    for store_type in ["in-memory-index", "embedded-doc-store", "relational-vector"] {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), store_type);

        let output = lumen(dir.path(), &["stats", "--format", "json"]);
        assert!(output.status.success(), "{store_type}: {}", String::from_utf8_lossy(&output.stderr));
        let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(stats["count"], 0);
        assert_eq!(stats["dimension"], 4);
        assert_eq!(stats["storeType"], store_type);
    }
}

#[test]
fn stats_text_names_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "in-memory-index");
    let output = lumen(dir.path(), &["stats"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Store: in-memory-index"), "{stdout}");
    assert!(stdout.contains("Vectors: 0"));
}

#[test]
fn delete_on_empty_index_removes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "relational-vector");
    let output = lumen(dir.path(), &["delete", "abc", "def"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Removed 0 of 2 entries"));
}

#[test]
fn embed_reports_missing_corpus() {
    let dir = tempfile::tempdir().unwrap();
    let output = lumen(dir.path(), &["embed", "--input", "missing.jsonl"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing.jsonl"));
}

#[test]
fn embed_reports_bad_corpus_line() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("corpus.jsonl"),
        "{\"text\": \"fn a() {}\"}\n\nnot json\n",
    )
    .unwrap();
    let output = lumen(dir.path(), &["embed", "--input", "corpus.jsonl"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("corpus.jsonl:3"));
}

#[test]
fn embed_without_api_key_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("corpus.jsonl"), "{\"text\": \"fn a() {}\"}\n").unwrap();
    let output = lumen(dir.path(), &["embed", "--input", "corpus.jsonl"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("VOYAGE_API_KEY"));
}

#[test]
fn malformed_filter_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let output = lumen(dir.path(), &["query", "auth", "--filter", "source"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("key=value"));
}

#[test]
fn inconsistent_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(".lumen.toml"),
        "[embedding]\ndimension = 8\n\n[store]\ndimension = 4\n",
    )
    .unwrap();
    assert!(!lumen(dir.path(), &["stats"]).status.success());
}

#[test]
fn verbose_logs_go_to_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let output = lumen(dir.path(), &["stats", "--verbose", "--format", "json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no .lumen.toml, using defaults"), "{stderr}");
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["count"], 0);
}
