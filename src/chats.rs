//! Chat registry: the in-memory chat list kept in sync with the `chats`
//! table, most recently used first.

use std::sync::{Arc, Mutex};

use crate::db::{Chat, Database};
use crate::error::Result;

pub struct ChatRegistry {
    db: Arc<Database>,
    inner: Mutex<Vec<Chat>>,
}

impl ChatRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn load_chats(&self) -> Result<()> {
        let chats = self.db.list_chats()?;
        *self.inner.lock().unwrap() = chats;
        Ok(())
    }

    pub fn chats(&self) -> Vec<Chat> {
        self.inner.lock().unwrap().clone()
    }

    pub fn create_chat(&self, model_id: Option<i64>, title: &str) -> Result<Chat> {
        let chat = self.db.create_chat(model_id, title)?;
        self.load_chats()?;
        Ok(chat)
    }

    pub fn rename_chat(&self, chat_id: i64, title: &str) -> Result<()> {
        self.db.rename_chat(chat_id, title)?;
        self.load_chats()
    }

    pub fn set_chat_model(&self, chat_id: i64, model_id: Option<i64>) -> Result<()> {
        self.db.set_chat_model(chat_id, model_id)?;
        self.load_chats()
    }

    pub fn delete_chat(&self, chat_id: i64) -> Result<()> {
        self.db.delete_chat(chat_id)?;
        self.load_chats()
    }
}
