//! Integration tests for process exit codes
//!
//! The server must fail fast with a non-zero exit code when its model
//! backend is unreachable at startup.

use std::process::Command;
use std::time::{Duration, Instant};

#[test]
fn test_exit_code_on_ollama_unreachable() {
    let bin_path = env!("CARGO_BIN_EXE_rust-entity-linker");
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");

    let mut process = Command::new(bin_path)
        .current_dir(temp_dir.path())
        .env("OLLAMA_URL", "http://127.0.0.1:59999")
        .env("QDRANT_URL", "http://127.0.0.1:59998")
        .env("LOG_DIR", temp_dir.path().to_str().unwrap())
        .env("MCP_HTTP_BIND", "127.0.0.1:0")
        .env_remove("DEVELOPMENT")
        .env_remove("DEV")
        .env_remove("CONSOLE_LOGS")
        .env_remove("RUST_LOG")
        .spawn()
        .expect("Failed to spawn process");

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match process.try_wait() {
            Ok(Some(status)) => {
                assert!(
                    !status.success(),
                    "Expected non-zero exit code when Ollama unreachable, got: {:?}",
                    status.code()
                );
                break;
            }
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Ok(None) => {
                let _ = process.kill();
                panic!("Server kept running although Ollama is unreachable");
            }
            Err(e) => panic!("Failed to check process status: {}", e),
        }
    }

    let log = std::fs::read_to_string(temp_dir.path().join("rust-entity-linker.log"))
        .expect("log file should be written");
    assert!(log.contains("Startup failed"));
}

#[test]
fn test_binary_exists() {
    let bin_path = env!("CARGO_BIN_EXE_rust-entity-linker");
    assert!(
        std::path::Path::new(bin_path).exists(),
        "Binary should exist at {}",
        bin_path
    );
}
