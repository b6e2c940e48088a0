//! Chat snapshot persistence.
//!
//! A chat is written as a whole JSON snapshot after each state transition
//! rather than incrementally; identity (`id`) is fixed once created and
//! `messages` only ever grows. The store itself is an opaque
//! directory-of-files key-value layer.

use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::core::conversation::Conversation;
use crate::core::message::Message;

const TITLE_MAX_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub title: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub path: String,
}

impl Chat {
    /// Snapshot the conversation for persistence. `None` until something
    /// has been committed; the first save happens on the first committed
    /// assistant turn.
    pub fn snapshot(conversation: &Conversation, user_id: &str) -> Option<Self> {
        let first = conversation.messages().first()?;
        let id = conversation.chat_id().to_string();
        Some(Self {
            title: chat_title(first.text().unwrap_or_default()),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            messages: conversation.messages().to_vec(),
            path: format!("/chat/{id}"),
            id,
        })
    }
}

/// First hundred characters of the first message, on a char boundary.
pub fn chat_title(first_message: &str) -> String {
    first_message.chars().take(TITLE_MAX_CHARS).collect()
}

pub struct ChatStore {
    dir: PathBuf,
}

impl ChatStore {
    pub fn open() -> Self {
        Self { dir: default_dir() }
    }

    pub fn open_at(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn save(&self, chat: &Chat) -> Result<(), Box<dyn Error>> {
        fs::create_dir_all(&self.dir)?;

        let contents = serde_json::to_string_pretty(chat)?;
        let mut temp_file = NamedTempFile::new_in(&self.dir)?;
        temp_file.write_all(contents.as_bytes())?;
        temp_file.as_file_mut().sync_all()?;
        temp_file
            .persist(self.chat_path(&chat.id))
            .map_err(|err| -> Box<dyn Error> { Box::new(err) })?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Option<Chat>, Box<dyn Error>> {
        let path = self.chat_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn chat_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn default_dir() -> PathBuf {
    let proj_dirs = ProjectDirs::from("org", "permacommons", "tickertalk")
        .expect("Failed to determine data directory");
    proj_dirs.data_dir().join("chats")
}
