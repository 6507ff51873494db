use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use headers::{authorization::Basic, Authorization, HeaderMapExt};
use hyper::header::{HeaderMap, HeaderValue, WWW_AUTHENTICATE};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::server::Response;

pub const USERS_FILE_NAME: &str = ".upduck-users.json";
const REALM: &str = "upduck";
const SALT_LEN: usize = 128;

/// A salted password hash for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    password_hash: String,
    #[serde(with = "base64_bytes")]
    password_salt: Vec<u8>,
}

impl Credential {
    pub fn new(password: &str) -> Self {
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let password_hash = hash_password(password, &salt);
        Self {
            password_hash,
            password_salt: salt,
        }
    }

    fn matches(&self, password: &str) -> bool {
        let candidate = hash_password(password, &self.password_salt);
        constant_time_eq(candidate.as_bytes(), self.password_hash.as_bytes())
    }
}

#[derive(Serialize, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: BTreeMap<String, Credential>,
}

/// Users allowed to access the server, persisted as JSON.
///
/// The map is only reachable through the lock; request handling takes the
/// read side, the user-management commands take the write side for the
/// mutation and the save that follows it.
#[derive(Debug)]
pub struct UserStore {
    path: PathBuf,
    users: RwLock<HashMap<String, Credential>>,
}

impl UserStore {
    /// Loads the store from `path`. A missing file is an empty store.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let users = match fs::read(&path) {
            Ok(data) => {
                let file: UsersFile = serde_json::from_slice(&data)
                    .with_context(|| format!("Invalid users file '{}'", path.display()))?;
                file.users.into_iter().collect()
            }
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read users file '{}'", path.display()))
            }
        };
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether requests must authenticate, i.e. at least one user exists.
    pub fn need_auth(&self) -> bool {
        !self.read().is_empty()
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn validate(&self, username: &str, password: &str) -> bool {
        let users = self.read();
        match users.get(username) {
            Some(credential) => credential.matches(password),
            None => false,
        }
    }

    /// Creates `username`, or replaces its password if it already exists.
    pub fn add_user(&self, username: &str, password: &str) -> Result<()> {
        if username.is_empty() {
            bail!("Username must not be empty");
        }
        if username.contains(':') {
            bail!("Username must not contain ':'");
        }
        let mut users = self.write();
        let previous = users.insert(username.to_string(), Credential::new(password));
        if let Err(err) = self.persist(&users) {
            match previous {
                Some(credential) => users.insert(username.to_string(), credential),
                None => users.remove(username),
            };
            return Err(err);
        }
        Ok(())
    }

    /// Returns whether the user existed.
    pub fn remove_user(&self, username: &str) -> Result<bool> {
        let mut users = self.write();
        let Some(credential) = users.remove(username) else {
            return Ok(false);
        };
        if let Err(err) = self.persist(&users) {
            users.insert(username.to_string(), credential);
            return Err(err);
        }
        Ok(true)
    }

    pub fn reset(&self) -> Result<()> {
        let mut users = self.write();
        let previous = std::mem::take(&mut *users);
        if let Err(err) = self.persist(&users) {
            *users = previous;
            return Err(err);
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Credential>> {
        self.users.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Credential>> {
        self.users.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes `<file>.temp` and renames it over the live file.
    fn persist(&self, users: &HashMap<String, Credential>) -> Result<()> {
        let snapshot = UsersFile {
            users: users
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        if let Some(parent) = self.path.parent().filter(|v| !v.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".temp");
        let tmp = PathBuf::from(tmp);

        let ret = write_snapshot(&tmp, &snapshot);
        if let Err(err) = ret {
            let _ = fs::remove_file(&tmp);
            return Err(err)
                .with_context(|| format!("Failed to write users file '{}'", tmp.display()));
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace users file '{}'", self.path.display()))
    }
}

fn write_snapshot(path: &Path, snapshot: &UsersFile) -> std::io::Result<()> {
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, snapshot)?;
    writer.write_all(b"\n")?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Outcome of checking a request against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No users configured, anyone may access.
    Anonymous,
    /// Valid credentials for this user.
    User(String),
    /// Credentials missing or wrong.
    Rejected,
}

pub fn check_auth(store: &UserStore, headers: &HeaderMap<HeaderValue>) -> AuthState {
    if !store.need_auth() {
        return AuthState::Anonymous;
    }
    match headers.typed_get::<Authorization<Basic>>() {
        Some(Authorization(basic)) if store.validate(basic.username(), basic.password()) => {
            AuthState::User(basic.username().to_string())
        }
        _ => AuthState::Rejected,
    }
}

pub fn www_authenticate(res: &mut Response) -> Result<()> {
    let value = HeaderValue::from_str(&format!("Basic realm=\"{REALM}\""))
        .map_err(|e| anyhow!("Invalid realm, {e}"))?;
    res.headers_mut().insert(WWW_AUTHENTICATE, value);
    Ok(())
}

fn hash_password(password: &str, salt: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

mod base64_bytes {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(value.as_bytes()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use base64::Engine as _;
    use std::sync::Arc;
    use std::thread;

    fn store_in(tmpdir: &TempDir) -> UserStore {
        UserStore::load(tmpdir.child(USERS_FILE_NAME).path()).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let tmpdir = TempDir::new().unwrap();
        let store = store_in(&tmpdir);
        assert!(!store.need_auth());
        assert_eq!(store.count(), 0);
        assert!(!store.validate("alice", "secret"));
    }

    #[test]
    fn test_validate() {
        let tmpdir = TempDir::new().unwrap();
        let store = store_in(&tmpdir);
        store.add_user("alice", "secret").unwrap();
        assert!(store.need_auth());
        assert!(store.validate("alice", "secret"));
        assert!(!store.validate("alice", "Secret"));
        assert!(!store.validate("alice", "secret "));
        assert!(!store.validate("alice", ""));
        assert!(!store.validate("bob", "secret"));
    }

    #[test]
    fn test_salts_differ_per_user() {
        let tmpdir = TempDir::new().unwrap();
        let store = store_in(&tmpdir);
        store.add_user("alice", "same").unwrap();
        store.add_user("bob", "same").unwrap();
        let users = store.read();
        assert_ne!(users["alice"].password_hash, users["bob"].password_hash);
        assert_eq!(users["alice"].password_salt.len(), SALT_LEN);
    }

    #[test]
    fn test_persist_and_reload() {
        let tmpdir = TempDir::new().unwrap();
        let store = store_in(&tmpdir);
        store.add_user("alice", "secret").unwrap();
        store.add_user("bob", "hunter2").unwrap();
        assert!(store.remove_user("bob").unwrap());
        assert!(!store.remove_user("bob").unwrap());

        let reloaded = store_in(&tmpdir);
        assert_eq!(reloaded.usernames(), vec!["alice".to_string()]);
        assert!(reloaded.validate("alice", "secret"));
        tmpdir
            .child(format!("{USERS_FILE_NAME}.temp"))
            .assert(predicates::path::missing());

        reloaded.reset().unwrap();
        assert!(!store_in(&tmpdir).need_auth());
    }

    #[test]
    fn test_file_format() {
        let tmpdir = TempDir::new().unwrap();
        let store = store_in(&tmpdir);
        store.add_user("alice", "secret").unwrap();
        let data = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&data).unwrap();
        let alice = &value["users"]["alice"];
        let hash = alice["password_hash"].as_str().unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        let salt = STANDARD
            .decode(alice["password_salt"].as_str().unwrap())
            .unwrap();
        assert_eq!(hash, hash_password("secret", &salt));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let tmpdir = TempDir::new().unwrap();
        tmpdir.child(USERS_FILE_NAME).write_str("{not json").unwrap();
        assert!(UserStore::load(tmpdir.child(USERS_FILE_NAME).path()).is_err());
    }

    #[test]
    fn test_failed_save_keeps_previous_file() {
        let tmpdir = TempDir::new().unwrap();
        let store = store_in(&tmpdir);
        store.add_user("alice", "secret").unwrap();
        let before = std::fs::read(store.path()).unwrap();

        // A directory in place of the temp file makes the temp write fail.
        tmpdir
            .child(format!("{USERS_FILE_NAME}.temp"))
            .create_dir_all()
            .unwrap();
        assert!(store.add_user("bob", "hunter2").is_err());
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
        assert!(!store.validate("bob", "hunter2"));
    }

    #[test]
    fn test_rejects_invalid_usernames() {
        let tmpdir = TempDir::new().unwrap();
        let store = store_in(&tmpdir);
        assert!(store.add_user("", "pw").is_err());
        assert!(store.add_user("a:b", "pw").is_err());
        assert!(!store.need_auth());
    }

    #[test]
    fn test_validate_during_mutation() {
        let tmpdir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&tmpdir));
        store.add_user("alice", "secret").unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        assert!(store.validate("alice", "secret"));
                        assert!(!store.validate("alice", "wrong"));
                    }
                })
            })
            .collect();
        for i in 0..20 {
            store.add_user(&format!("user{i}"), "pw").unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.count(), 21);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_check_auth() {
        let tmpdir = TempDir::new().unwrap();
        let store = store_in(&tmpdir);
        let mut headers = HeaderMap::new();
        assert_eq!(check_auth(&store, &headers), AuthState::Anonymous);

        store.add_user("alice", "secret").unwrap();
        assert_eq!(check_auth(&store, &headers), AuthState::Rejected);

        headers.typed_insert(Authorization::basic("alice", "secret"));
        assert_eq!(
            check_auth(&store, &headers),
            AuthState::User("alice".to_string())
        );

        headers.typed_insert(Authorization::basic("alice", "nope"));
        assert_eq!(check_auth(&store, &headers), AuthState::Rejected);
    }
}
