//! User management subcommands

mod utils;

use assert_cmd::prelude::*;
use assert_fs::fixture::TempDir;
use fixtures::{config_dir, upduck, Error};
use predicates::str::contains;
use rstest::rstest;

const USERS_FILE: &str = ".upduck-users.json";

fn users_json(config_dir: &TempDir) -> Result<serde_json::Value, Error> {
    let data = std::fs::read(config_dir.path().join(USERS_FILE))?;
    Ok(serde_json::from_slice(&data)?)
}

#[rstest]
fn adduser_writes_file(config_dir: TempDir) -> Result<(), Error> {
    upduck(&config_dir)
        .args(["adduser", "alice", "--password", "secret"])
        .assert()
        .success()
        .stdout(contains("alice"));

    let json = users_json(&config_dir)?;
    let alice = &json["users"]["alice"];
    let hash = alice["password_hash"].as_str().unwrap();
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(alice["password_salt"].as_str().is_some());
    assert!(!json.to_string().contains("secret"));
    Ok(())
}

#[rstest]
fn adduser_reads_stdin(config_dir: TempDir) -> Result<(), Error> {
    assert_cmd::Command::from_std(upduck(&config_dir))
        .args(["adduser", "bob"])
        .write_stdin("hunter2\n")
        .assert()
        .success();
    assert!(users_json(&config_dir)?["users"]["bob"].is_object());
    Ok(())
}

#[rstest]
fn adduser_rejects_empty_password(config_dir: TempDir) -> Result<(), Error> {
    assert_cmd::Command::from_std(upduck(&config_dir))
        .args(["adduser", "bob"])
        .write_stdin("\n")
        .assert()
        .failure()
        .stderr(contains("Error:"));
    Ok(())
}

#[rstest]
fn adduser_replaces_password(config_dir: TempDir) -> Result<(), Error> {
    upduck(&config_dir)
        .args(["adduser", "alice", "--password", "one"])
        .assert()
        .success();
    let first = users_json(&config_dir)?;
    upduck(&config_dir)
        .args(["adduser", "alice", "--password", "two"])
        .assert()
        .success();
    let second = users_json(&config_dir)?;
    assert_eq!(second["users"].as_object().unwrap().len(), 1);
    assert_ne!(
        first["users"]["alice"]["password_salt"],
        second["users"]["alice"]["password_salt"]
    );
    Ok(())
}

#[rstest]
fn deluser(config_dir: TempDir) -> Result<(), Error> {
    for name in ["alice", "bob"] {
        upduck(&config_dir)
            .args(["adduser", name, "--password", "pw"])
            .assert()
            .success();
    }
    upduck(&config_dir)
        .args(["deluser", "alice"])
        .assert()
        .success();
    let json = users_json(&config_dir)?;
    assert!(json["users"].get("alice").is_none());
    assert!(json["users"].get("bob").is_some());

    upduck(&config_dir)
        .args(["deluser", "alice"])
        .assert()
        .failure()
        .stderr(contains("does not exist"));
    Ok(())
}

#[rstest]
fn resetusers(config_dir: TempDir) -> Result<(), Error> {
    upduck(&config_dir)
        .args(["adduser", "alice", "--password", "pw"])
        .assert()
        .success();
    upduck(&config_dir).arg("resetusers").assert().success();
    let json = users_json(&config_dir)?;
    assert!(json["users"].as_object().unwrap().is_empty());
    Ok(())
}
