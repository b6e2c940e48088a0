//! Durable auth session state.
//!
//! The API key lives in the system keyring; the PKCE pair and dialog flag
//! live in a small TOML state file under the platform config directory so
//! they survive a full restart, including the moment the authorization
//! redirect comes back with a code. Tests (and keyring-less environments)
//! can disable the keyring, in which case the key falls back to the state
//! file.

use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use directories::ProjectDirs;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::auth::pkce;
use crate::core::constants::KEY_OPENROUTER_KEY;

const KEYRING_SERVICE: &str = "tickertalk";
const STATE_FILE: &str = "auth.toml";

/// Errors that can occur when loading auth state from disk.
#[derive(Debug)]
pub enum StoreError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Read { path, source } => {
                write!(f, "Failed to read auth state at {}: {}", path.display(), source)
            }
            StoreError::Parse { path, source } => {
                write!(f, "Failed to parse auth state at {}: {}", path.display(), source)
            }
        }
    }
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            StoreError::Read { source, .. } => Some(source),
            StoreError::Parse { source, .. } => Some(source),
        }
    }
}

/// On-disk shape. Field names are the stable storage key names; renaming
/// them orphans existing state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedAuthState {
    #[serde(rename = "codeVerifier", default, skip_serializing_if = "Option::is_none")]
    code_verifier: Option<String>,
    #[serde(rename = "codeChallenge", default, skip_serializing_if = "Option::is_none")]
    code_challenge: Option<String>,
    #[serde(rename = "isDialogOpen", default)]
    is_dialog_open: bool,
    /// Only populated when the keyring is disabled.
    #[serde(rename = "openRouterKey", default, skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
}

pub struct AuthStore {
    state_path: PathBuf,
    use_keyring: bool,
    state: PersistedAuthState,
}

impl AuthStore {
    pub fn open() -> Result<Self, Box<dyn StdError>> {
        Self::open_at(default_state_path(), true)
    }

    /// Open a store at an explicit path, optionally without keyring access
    /// (useful for tests).
    pub fn open_at(state_path: PathBuf, use_keyring: bool) -> Result<Self, Box<dyn StdError>> {
        let state = if state_path.exists() {
            let contents = fs::read_to_string(&state_path).map_err(|source| StoreError::Read {
                path: state_path.clone(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| StoreError::Parse {
                path: state_path.clone(),
                source,
            })?
        } else {
            PersistedAuthState::default()
        };

        Ok(Self {
            state_path,
            use_keyring,
            state,
        })
    }

    /// Lazily initialize the PKCE pair. The pair is generated exactly once
    /// per store lifetime and never rotated afterwards; this is the single
    /// initialization point for it.
    pub fn ensure_pkce(&mut self) -> Result<(String, String), Box<dyn StdError>> {
        if let (Some(verifier), Some(challenge)) =
            (&self.state.code_verifier, &self.state.code_challenge)
        {
            return Ok((verifier.clone(), challenge.clone()));
        }

        let verifier = pkce::generate_verifier()?;
        let challenge = pkce::derive_challenge(&verifier);
        self.state.code_verifier = Some(verifier.clone());
        self.state.code_challenge = Some(challenge.clone());
        self.persist()?;
        Ok((verifier, challenge))
    }

    pub fn verifier(&self) -> Option<&str> {
        self.state.code_verifier.as_deref()
    }

    pub fn challenge(&self) -> Option<&str> {
        self.state.code_challenge.as_deref()
    }

    pub fn api_key(&self) -> Result<Option<String>, Box<dyn StdError>> {
        if !self.use_keyring {
            return Ok(self.state.api_key.clone());
        }
        let entry = Entry::new(KEYRING_SERVICE, KEY_OPENROUTER_KEY)?;
        match entry.get_password() {
            Ok(key) => Ok(Some(key)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(Box::new(err)),
        }
    }

    pub fn set_api_key(&mut self, key: &str) -> Result<(), Box<dyn StdError>> {
        if self.use_keyring {
            let entry = Entry::new(KEYRING_SERVICE, KEY_OPENROUTER_KEY)?;
            entry.set_password(key)?;
        } else {
            self.state.api_key = Some(key.to_string());
            self.persist()?;
        }
        Ok(())
    }

    /// Sign-out removes only the key. The PKCE pair deliberately survives
    /// so an authorization issued for the cached challenge stays
    /// exchangeable; rotating the pair here would be the stricter posture.
    pub fn clear_api_key(&mut self) -> Result<(), Box<dyn StdError>> {
        if self.use_keyring {
            let entry = Entry::new(KEYRING_SERVICE, KEY_OPENROUTER_KEY)?;
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(err) => return Err(Box::new(err)),
            }
        } else {
            self.state.api_key = None;
            self.persist()?;
        }
        Ok(())
    }

    pub fn is_dialog_open(&self) -> bool {
        self.state.is_dialog_open
    }

    pub fn set_dialog_open(&mut self, open: bool) -> Result<(), Box<dyn StdError>> {
        self.state.is_dialog_open = open;
        self.persist()
    }

    fn persist(&self) -> Result<(), Box<dyn StdError>> {
        let parent = self
            .state_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if let Some(dir) = parent {
            fs::create_dir_all(dir)?;
        }

        let contents = toml::to_string_pretty(&self.state)?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };

        temp_file.write_all(contents.as_bytes())?;
        temp_file.as_file_mut().sync_all()?;
        temp_file
            .persist(&self.state_path)
            .map_err(|err| -> Box<dyn StdError> { Box::new(err) })?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn state_path(&self) -> &std::path::Path {
        &self.state_path
    }
}

fn default_state_path() -> PathBuf {
    let proj_dirs = ProjectDirs::from("org", "permacommons", "tickertalk")
        .expect("Failed to determine config directory");
    proj_dirs.config_dir().join(STATE_FILE)
}
