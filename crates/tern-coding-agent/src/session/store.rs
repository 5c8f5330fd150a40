use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

use tern_agent_core::types::{Message, ThinkingLevel};

use crate::config::paths;
use crate::error::TernError;
use crate::session::context::{SessionContext, build_session_context};
use crate::session::tree::SessionTree;
use crate::session::types::*;

/// Create a new file with restrictive permissions on Unix (0600).
fn create_new_restricted(path: &Path) -> std::io::Result<std::fs::File> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }

    opts.open(path)
}

fn validate_session_id(session_id: &str) -> Result<(), TernError> {
    if session_id.is_empty() {
        return Err(TernError::Session("session id cannot be empty".to_string()));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TernError::Session(format!(
            "invalid session id: {session_id} (only [a-zA-Z0-9_-] allowed)"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct NewSessionOptions {
    pub cwd: Option<String>,
    pub parent_session: Option<String>,
}

/// Authoritative, append-only, branching conversation history.
///
/// Entries form a tree (every non-root entry has exactly one parent, parents
/// are never rewritten); `leaf_id` selects the active branch. Persistence is
/// line-oriented JSON appends to `sessions/<id>.jsonl`; an in-memory store
/// has no file and silently skips persistence. A failed append never
/// advances the leaf.
pub struct SessionStore {
    header: SessionHeader,
    entries: Vec<SessionEntry>,
    index: HashMap<String, usize>,
    leaf_id: Option<String>,
    file_path: Option<PathBuf>,
    sessions_dir: Option<PathBuf>,
}

impl SessionStore {
    /// A store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            header: SessionHeader {
                entry_type: "session".to_string(),
                version: Some(CURRENT_SESSION_VERSION),
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: now_iso_timestamp(),
                cwd: String::new(),
                parent_session: None,
            },
            entries: Vec::new(),
            index: HashMap::new(),
            leaf_id: None,
            file_path: None,
            sessions_dir: None,
        }
    }

    /// Create a fresh persisted session under `sessions_dir`.
    pub fn create(sessions_dir: &Path, options: NewSessionOptions) -> Result<Self, TernError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        Self::create_with_id(sessions_dir, &session_id, options)
    }

    pub fn create_with_id(
        sessions_dir: &Path,
        session_id: &str,
        options: NewSessionOptions,
    ) -> Result<Self, TernError> {
        validate_session_id(session_id)?;
        paths::ensure_dir(sessions_dir)?;

        let header = SessionHeader {
            entry_type: "session".to_string(),
            version: Some(CURRENT_SESSION_VERSION),
            id: session_id.to_string(),
            timestamp: now_iso_timestamp(),
            cwd: options.cwd.unwrap_or_default(),
            parent_session: options.parent_session,
        };

        let path = sessions_dir.join(format!("{session_id}.jsonl"));
        let mut file = create_new_restricted(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                TernError::Session(format!("session already exists: {session_id}"))
            } else {
                TernError::Io(e)
            }
        })?;
        let line = serde_json::to_string(&header)?;
        writeln!(file, "{line}")?;

        Ok(Self {
            header,
            entries: Vec::new(),
            index: HashMap::new(),
            leaf_id: None,
            file_path: Some(path),
            sessions_dir: Some(sessions_dir.to_path_buf()),
        })
    }

    /// Open an existing session file. The leaf is set to the last entry in
    /// file order; malformed lines are skipped with a warning.
    pub fn open(sessions_dir: &Path, session_id: &str) -> Result<Self, TernError> {
        validate_session_id(session_id)?;
        let path = sessions_dir.join(format!("{session_id}.jsonl"));
        if !path.exists() {
            return Err(TernError::Session(format!(
                "session not found: {session_id}"
            )));
        }

        let file = std::fs::File::open(&path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| TernError::Session("empty session file".to_string()))??;
        let header: SessionHeader = serde_json::from_str(&header_line)?;
        if header.entry_type != "session" {
            return Err(TernError::Session(format!(
                "invalid session header in {}",
                path.display()
            )));
        }

        let mut entries = Vec::new();
        let mut index = HashMap::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEntry>(&line) {
                Ok(entry) => {
                    index.insert(entry.id().to_string(), entries.len());
                    entries.push(entry);
                }
                Err(e) => tracing::warn!("skipping malformed session entry: {e}"),
            }
        }

        let leaf_id = entries.last().map(|e| e.id().to_string());

        Ok(Self {
            header,
            entries,
            index,
            leaf_id,
            file_path: Some(path),
            sessions_dir: Some(sessions_dir.to_path_buf()),
        })
    }

    // ---------- Accessors ----------

    pub fn session_id(&self) -> &str {
        &self.header.id
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn leaf_id(&self) -> Option<&str> {
        self.leaf_id.as_deref()
    }

    pub fn get_entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn get_entry(&self, id: &str) -> Option<&SessionEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// The active branch, in root-to-leaf order.
    pub fn get_branch(&self) -> Vec<&SessionEntry> {
        let mut path = Vec::new();
        let mut current = self.leaf_id.as_deref();
        while let Some(id) = current {
            match self.get_entry(id) {
                Some(entry) => {
                    path.push(entry);
                    current = entry.parent_id();
                }
                None => break,
            }
        }
        path.reverse();
        path
    }

    /// Navigator view of the whole tree (nodes, children, labels).
    pub fn get_tree(&self) -> SessionTree {
        SessionTree::from_entries(&self.entries)
    }

    /// Replay the active branch into the messages, model and thinking level
    /// the agent must be synced with.
    pub fn build_session_context(&self) -> SessionContext {
        build_session_context(&self.get_branch())
    }

    /// Last session name set on the branch, if any.
    pub fn session_name(&self) -> Option<String> {
        self.get_branch().iter().rev().find_map(|e| match e {
            SessionEntry::SessionInfo { name, .. } => name.clone(),
            _ => None,
        })
    }

    // ---------- Append operations ----------

    /// Write-then-commit: the line is persisted before any in-memory state
    /// changes, so an IO failure leaves the store untouched.
    fn append_entry(&mut self, entry: SessionEntry) -> Result<String, TernError> {
        if let Some(path) = &self.file_path {
            let line = serde_json::to_string(&entry)?;
            let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
            writeln!(file, "{line}")?;
        }
        let id = entry.id().to_string();
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(id)
    }

    fn append_to_branch(&mut self, entry: SessionEntry) -> Result<String, TernError> {
        let id = self.append_entry(entry)?;
        self.leaf_id = Some(id.clone());
        Ok(id)
    }

    fn next_ids(&self) -> (String, Option<String>, String) {
        (
            SessionEntry::new_id(),
            self.leaf_id.clone(),
            now_iso_timestamp(),
        )
    }

    pub fn append_message(&mut self, message: Message) -> Result<String, TernError> {
        let (id, parent_id, timestamp) = self.next_ids();
        self.append_to_branch(SessionEntry::Message {
            id,
            parent_id,
            timestamp,
            message,
        })
    }

    pub fn append_custom_message(
        &mut self,
        custom_type: &str,
        content: Value,
        display: bool,
        details: Option<Value>,
    ) -> Result<String, TernError> {
        let (id, parent_id, timestamp) = self.next_ids();
        self.append_to_branch(SessionEntry::CustomMessage {
            id,
            parent_id,
            timestamp,
            custom_type: custom_type.to_string(),
            content,
            display,
            details,
        })
    }

    pub fn append_custom_entry(
        &mut self,
        custom_type: &str,
        data: Option<Value>,
    ) -> Result<String, TernError> {
        let (id, parent_id, timestamp) = self.next_ids();
        self.append_to_branch(SessionEntry::Custom {
            id,
            parent_id,
            timestamp,
            custom_type: custom_type.to_string(),
            data,
        })
    }

    pub fn append_model_change(
        &mut self,
        provider: &str,
        model_id: &str,
    ) -> Result<String, TernError> {
        let (id, parent_id, timestamp) = self.next_ids();
        self.append_to_branch(SessionEntry::ModelChange {
            id,
            parent_id,
            timestamp,
            provider: provider.to_string(),
            model_id: model_id.to_string(),
        })
    }

    pub fn append_thinking_level_change(
        &mut self,
        level: ThinkingLevel,
    ) -> Result<String, TernError> {
        let (id, parent_id, timestamp) = self.next_ids();
        self.append_to_branch(SessionEntry::ThinkingLevelChange {
            id,
            parent_id,
            timestamp,
            thinking_level: level,
        })
    }

    pub fn append_session_info(&mut self, name: Option<String>) -> Result<String, TernError> {
        let (id, parent_id, timestamp) = self.next_ids();
        self.append_to_branch(SessionEntry::SessionInfo {
            id,
            parent_id,
            timestamp,
            name,
        })
    }

    /// Tag any existing entry with a label (or clear it with `None`).
    /// Duplicate labels are not coalesced; the tree view resolves to the
    /// last label entry for a target.
    pub fn append_label_change(
        &mut self,
        target_id: &str,
        label: Option<String>,
    ) -> Result<String, TernError> {
        if self.get_entry(target_id).is_none() {
            return Err(TernError::InvalidEntry(target_id.to_string()));
        }
        let (id, parent_id, timestamp) = self.next_ids();
        self.append_to_branch(SessionEntry::Label {
            id,
            parent_id,
            timestamp,
            target_id: target_id.to_string(),
            label,
        })
    }

    pub fn append_compaction(
        &mut self,
        summary: String,
        first_kept_entry_id: String,
        tokens_before: u64,
        details: Option<Value>,
        from_hook: Option<bool>,
    ) -> Result<String, TernError> {
        if !self.is_on_branch(&first_kept_entry_id) {
            return Err(TernError::InvalidEntry(first_kept_entry_id));
        }
        let (id, parent_id, timestamp) = self.next_ids();
        self.append_to_branch(SessionEntry::Compaction {
            id,
            parent_id,
            timestamp,
            summary,
            first_kept_entry_id,
            tokens_before,
            details,
            from_hook,
        })
    }

    /// Whether `entry_id` lies on the path from the current leaf to the root.
    fn is_on_branch(&self, entry_id: &str) -> bool {
        let mut current = self.leaf_id.as_deref();
        while let Some(id) = current {
            if id == entry_id {
                return true;
            }
            current = self.get_entry(id).and_then(|e| e.parent_id());
        }
        false
    }

    // ---------- Branch operations ----------

    /// Move the leaf pointer to an existing entry. The move itself is not
    /// persisted; the next append (which parents to the new leaf) makes it
    /// durable.
    pub fn branch(&mut self, new_leaf_id: &str) -> Result<(), TernError> {
        if self.get_entry(new_leaf_id).is_none() {
            return Err(TernError::InvalidEntry(new_leaf_id.to_string()));
        }
        self.leaf_id = Some(new_leaf_id.to_string());
        Ok(())
    }

    /// Set the leaf back to the root (empty branch).
    pub fn reset_leaf(&mut self) {
        self.leaf_id = None;
    }

    /// Move the leaf to `parent_entry_id` and record a summary of the branch
    /// being abandoned. Returns the id of the branch-summary entry.
    pub fn branch_with_summary(
        &mut self,
        parent_entry_id: Option<&str>,
        summary: String,
        details: Option<Value>,
        from_hook: Option<bool>,
    ) -> Result<String, TernError> {
        let from_id = self
            .leaf_id
            .clone()
            .ok_or_else(|| TernError::InvalidEntry("no leaf to summarize from".to_string()))?;

        match parent_entry_id {
            Some(id) => self.branch(id)?,
            None => self.reset_leaf(),
        }

        let (id, parent_id, timestamp) = self.next_ids();
        let result = self.append_to_branch(SessionEntry::BranchSummary {
            id,
            parent_id,
            timestamp,
            from_id: from_id.clone(),
            summary,
            details,
            from_hook,
        });

        // Restore the old leaf if the append failed, so a disk error does
        // not leave the store half-moved.
        if result.is_err() {
            self.leaf_id = Some(from_id);
        }
        result
    }

    /// Create a new session file rooted at `parent_entry_id`: the ancestor
    /// chain is copied so the new session is self-contained, and the header
    /// records this session as its parent.
    pub fn create_branched_session(
        &self,
        parent_entry_id: &str,
    ) -> Result<SessionStore, TernError> {
        if self.get_entry(parent_entry_id).is_none() {
            return Err(TernError::InvalidEntry(parent_entry_id.to_string()));
        }
        let sessions_dir = self.sessions_dir.clone().ok_or_else(|| {
            TernError::Session("cannot branch an in-memory session into a file".to_string())
        })?;

        let mut chain = Vec::new();
        let mut current = Some(parent_entry_id);
        while let Some(id) = current {
            match self.get_entry(id) {
                Some(entry) => {
                    chain.push(entry.clone());
                    current = entry.parent_id();
                }
                None => break,
            }
        }
        chain.reverse();

        let mut store = SessionStore::create(
            &sessions_dir,
            NewSessionOptions {
                cwd: Some(self.header.cwd.clone()),
                parent_session: Some(self.header.id.clone()),
            },
        )?;
        for entry in chain {
            store.append_to_branch_preserving(entry)?;
        }
        Ok(store)
    }

    /// Append an entry copied from another session, keeping its id but
    /// re-parenting it onto this store's leaf.
    fn append_to_branch_preserving(&mut self, mut entry: SessionEntry) -> Result<(), TernError> {
        entry.set_parent_id(self.leaf_id.clone());
        self.append_to_branch(entry)?;
        Ok(())
    }

    // ---------- Listings ----------

    /// List sessions under a directory, most recently updated first.
    pub fn list(sessions_dir: &Path) -> Result<Vec<SessionInfo>, TernError> {
        if !sessions_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for dir_entry in std::fs::read_dir(sessions_dir)? {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                if let Some(info) = read_session_info(&path) {
                    sessions.push(info);
                }
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }
}

fn read_session_info(path: &Path) -> Option<SessionInfo> {
    let file = std::fs::File::open(path).ok()?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let header_line = lines.next()?.ok()?;
    let header: SessionHeader = serde_json::from_str(&header_line).ok()?;
    if header.entry_type != "session" {
        return None;
    }

    let mut entry_count = 0usize;
    let mut updated_at = header.timestamp_ms();
    let mut name = None;

    for line in lines.map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        entry_count += 1;
        if let Ok(entry) = serde_json::from_str::<SessionEntry>(&line) {
            updated_at = updated_at.max(entry.timestamp_ms());
            if let SessionEntry::SessionInfo { name: n, .. } = &entry {
                name = n.clone();
            }
        }
    }

    let created_at = header.timestamp_ms();
    Some(SessionInfo {
        session_id: header.id,
        name,
        created_at,
        updated_at,
        entry_count,
        parent_session_id: header.parent_session,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_agent_core::types::{
        AssistantMessage, ContentBlock, StopReason, Usage, UserContent, UserMessage,
    };

    fn user_message(text: &str) -> Message {
        Message::User(UserMessage {
            content: UserContent::Text(text.to_string()),
            timestamp: 1_700_000_000_000,
        })
    }

    fn assistant_message(text: &str) -> Message {
        Message::Assistant(AssistantMessage {
            content: vec![ContentBlock::text(text)],
            provider: "stub".to_string(),
            model: "stub-1".to_string(),
            usage: Usage::default(),
            stop_reason: StopReason::Complete,
            error_message: None,
            timestamp: 1_700_000_000_001,
        })
    }

    #[test]
    fn appends_chain_parent_ids_along_the_branch() {
        let mut store = SessionStore::in_memory();
        let e1 = store.append_message(user_message("one")).unwrap();
        let e2 = store.append_message(assistant_message("two")).unwrap();

        let branch = store.get_branch();
        assert_eq!(branch.len(), 2);
        assert_eq!(branch[0].id(), e1);
        assert_eq!(branch[0].parent_id(), None);
        assert_eq!(branch[1].id(), e2);
        assert_eq!(branch[1].parent_id(), Some(e1.as_str()));
        assert_eq!(store.leaf_id(), Some(e2.as_str()));
    }

    #[test]
    fn branch_preserves_subtree_and_moves_leaf() {
        let mut store = SessionStore::in_memory();
        let u1 = store.append_message(user_message("U1")).unwrap();
        let _a1 = store.append_message(assistant_message("A1")).unwrap();
        let _u2 = store.append_message(user_message("U2")).unwrap();
        let a2 = store.append_message(assistant_message("A2")).unwrap();

        // Rewind to before U1 (its parent is the root).
        store.reset_leaf();
        assert!(store.get_branch().is_empty());

        // Everything is still reachable.
        assert_eq!(store.get_entries().len(), 4);
        assert!(store.get_entry(&u1).is_some());
        assert!(store.get_entry(&a2).is_some());

        // Appending now creates a sibling of U1.
        let u1b = store.append_message(user_message("U1b")).unwrap();
        assert_eq!(store.get_entry(&u1b).unwrap().parent_id(), None);
    }

    #[test]
    fn branch_to_leaf_is_a_no_op() {
        let mut store = SessionStore::in_memory();
        store.append_message(user_message("one")).unwrap();
        let leaf = store.leaf_id().unwrap().to_string();
        store.branch(&leaf).unwrap();
        assert_eq!(store.leaf_id(), Some(leaf.as_str()));
    }

    #[test]
    fn branch_to_unknown_entry_is_invalid() {
        let mut store = SessionStore::in_memory();
        store.append_message(user_message("one")).unwrap();
        assert!(matches!(
            store.branch("nope"),
            Err(TernError::InvalidEntry(_))
        ));
    }

    #[test]
    fn compaction_requires_kept_entry_on_branch() {
        let mut store = SessionStore::in_memory();
        let u1 = store.append_message(user_message("one")).unwrap();
        store.append_message(assistant_message("two")).unwrap();

        assert!(
            store
                .append_compaction("summary".into(), u1, 100, None, None)
                .is_ok()
        );
        assert!(matches!(
            store.append_compaction("summary".into(), "missing".into(), 100, None, None),
            Err(TernError::InvalidEntry(_))
        ));
    }

    #[test]
    fn branch_with_summary_records_abandoned_leaf() {
        let mut store = SessionStore::in_memory();
        let u1 = store.append_message(user_message("U1")).unwrap();
        store.append_message(assistant_message("A1")).unwrap();
        let u2 = store.append_message(user_message("U2")).unwrap();

        let summary_id = store
            .branch_with_summary(Some(&u1), "went down a dead end".into(), None, None)
            .unwrap();

        let entry = store.get_entry(&summary_id).unwrap();
        match entry {
            SessionEntry::BranchSummary {
                from_id, parent_id, ..
            } => {
                assert_eq!(from_id, &u2);
                assert_eq!(parent_id.as_deref(), Some(u1.as_str()));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
        assert_eq!(store.leaf_id(), Some(summary_id.as_str()));
    }

    #[test]
    fn persisted_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = SessionStore::create(tmp.path(), NewSessionOptions::default()).unwrap();
        store.append_message(user_message("hello")).unwrap();
        store.append_message(assistant_message("hi")).unwrap();
        store
            .append_thinking_level_change(ThinkingLevel::Medium)
            .unwrap();
        let id = store.session_id().to_string();
        let context_before = store.build_session_context();

        let reopened = SessionStore::open(tmp.path(), &id).unwrap();
        assert_eq!(reopened.get_entries().len(), 3);
        assert_eq!(reopened.leaf_id(), store.leaf_id());

        let context_after = reopened.build_session_context();
        assert_eq!(
            serde_json::to_string(&crate::messages::convert::convert_to_llm(
                &context_before.messages
            ))
            .unwrap(),
            serde_json::to_string(&crate::messages::convert::convert_to_llm(
                &context_after.messages
            ))
            .unwrap()
        );
        assert_eq!(context_after.thinking_level, ThinkingLevel::Medium);
    }

    #[test]
    fn unknown_entry_types_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::create(tmp.path(), NewSessionOptions::default()).unwrap();
        let id = store.session_id().to_string();

        // Simulate a future version writing an entry type we do not know.
        let path = store.file_path().unwrap().to_path_buf();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        writeln!(
            file,
            r#"{{"type":"future_thing","id":"f1","parentId":null,"timestamp":"2026-01-01T00:00:00.000Z","extra":42}}"#
        )
        .unwrap();

        let mut reopened = SessionStore::open(tmp.path(), &id).unwrap();
        assert_eq!(reopened.get_entries().len(), 1);
        assert_eq!(reopened.get_entries()[0].entry_type(), "unknown");

        // Appending after the unknown entry parents to it and the file
        // still contains the foreign line verbatim.
        reopened.append_message(user_message("later")).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains(r#""type":"future_thing""#));
        assert!(contents.contains(r#""extra":42"#));
    }

    #[test]
    fn create_branched_session_copies_ancestors() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = SessionStore::create(tmp.path(), NewSessionOptions::default()).unwrap();
        let u1 = store.append_message(user_message("U1")).unwrap();
        let a1 = store.append_message(assistant_message("A1")).unwrap();
        store.append_message(user_message("U2")).unwrap();

        let branched = store.create_branched_session(&a1).unwrap();
        assert_eq!(
            branched.header().parent_session.as_deref(),
            Some(store.session_id())
        );
        assert_eq!(branched.get_entries().len(), 2);
        assert_eq!(branched.get_entries()[0].id(), u1);
        assert_eq!(branched.get_entries()[1].id(), a1);

        // The branched file is independently openable.
        let reopened = SessionStore::open(tmp.path(), branched.session_id()).unwrap();
        assert_eq!(reopened.get_entries().len(), 2);
    }

    #[test]
    fn label_requires_existing_target() {
        let mut store = SessionStore::in_memory();
        let u1 = store.append_message(user_message("one")).unwrap();
        assert!(store.append_label_change(&u1, Some("wip".into())).is_ok());
        assert!(matches!(
            store.append_label_change("missing", None),
            Err(TernError::InvalidEntry(_))
        ));
    }

    #[test]
    fn list_sessions_reports_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = SessionStore::create(tmp.path(), NewSessionOptions::default()).unwrap();
        a.append_message(user_message("hello")).unwrap();
        a.append_session_info(Some("my session".into())).unwrap();
        SessionStore::create(tmp.path(), NewSessionOptions::default()).unwrap();

        let sessions = SessionStore::list(tmp.path()).unwrap();
        assert_eq!(sessions.len(), 2);
        let named = sessions
            .iter()
            .find(|s| s.session_id == a.session_id())
            .unwrap();
        assert_eq!(named.name.as_deref(), Some("my session"));
        assert_eq!(named.entry_count, 2);
    }
}
