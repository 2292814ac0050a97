use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::sync::RwLock;

/// Messages are windowed by exclusive id bounds; this is the open upper
/// bound used when the caller does not constrain the window (2^53, the
/// largest range representable without loss on the JSON side).
pub const MAX_ITEM_ID: i64 = 1 << 53;

/// Maximum number of messages returned by a single window query.
pub const MESSAGE_PAGE: usize = 50;

#[derive(Debug, PartialEq, Eq)]
pub enum StorageError {
    Missing,
    Invalid,
    Duplicate,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing record"),
            Self::Invalid => write!(f, "invalid request"),
            Self::Duplicate => write!(f, "duplicate record"),
        }
    }
}

impl Error for StorageError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Moderator,
    Owner,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Moderator => "moderator",
            Self::Owner => "owner",
        }
    }

    pub fn from_label(label: &str) -> Option<Role> {
        match label {
            "user" => Some(Role::User),
            "moderator" => Some(Role::Moderator),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleKind {
    Chat,
    Task,
    Calendar,
    Poll,
    Custom(String),
}

impl ModuleKind {
    pub fn label(&self) -> &str {
        match self {
            Self::Chat => "chat",
            Self::Task => "task",
            Self::Calendar => "cal",
            Self::Poll => "poll",
            Self::Custom(label) => label,
        }
    }

    pub fn from_label(label: &str) -> ModuleKind {
        match label {
            "chat" => ModuleKind::Chat,
            "task" => ModuleKind::Task,
            "cal" => ModuleKind::Calendar,
            "poll" => ModuleKind::Poll,
            other => ModuleKind::Custom(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub two_factor: bool,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMember {
    pub user: i64,
    pub role: Role,
    pub muted: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserInfo {
    pub id: i64,
    pub name: String,
    pub role: Role,
    pub muted: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupSummary {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSummary {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub id: i64,
    pub name: String,
    pub require_approval: bool,
    pub direct: bool,
    pub modified: i64,
    pub users: Vec<UserInfo>,
    pub modules: Vec<ModuleSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Reaction {
    pub user: i64,
    pub reaction: String,
}

/// A chat message. Deletion is represented as empty `contents`; the
/// sequential id is never reused.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub sender: i64,
    pub timestamp: i64,
    pub contents: String,
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskItem {
    pub id: i64,
    pub author: i64,
    pub created: i64,
    pub deadline: i64,
    pub description: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EventItem {
    pub id: i64,
    pub author: i64,
    pub description: String,
    pub start: i64,
    pub end: i64,
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollItem {
    pub id: i64,
    pub author: i64,
    pub description: String,
    pub options: Vec<String>,
    pub votes: HashMap<i64, usize>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Invite {
    pub group: i64,
    #[serde(rename = "name")]
    pub group_name: String,
    #[serde(rename = "inviter")]
    pub inviter_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteLink {
    pub code: String,
    pub group: i64,
    /// Milliseconds since epoch; 0 means the link never expires.
    pub expire_at: i64,
}

#[derive(Debug)]
enum ModuleItems {
    Messages(Vec<Message>),
    Tasks(Vec<TaskItem>),
    Events(Vec<EventItem>),
    Polls(Vec<PollItem>),
    None,
}

impl ModuleItems {
    fn for_kind(kind: &ModuleKind) -> ModuleItems {
        match kind {
            ModuleKind::Chat => ModuleItems::Messages(Vec::new()),
            ModuleKind::Task => ModuleItems::Tasks(Vec::new()),
            ModuleKind::Calendar => ModuleItems::Events(Vec::new()),
            ModuleKind::Poll => ModuleItems::Polls(Vec::new()),
            ModuleKind::Custom(_) => ModuleItems::None,
        }
    }
}

#[derive(Debug)]
struct ModuleDoc {
    id: i64,
    group: i64,
    name: String,
    kind: ModuleKind,
    enabled: bool,
    next_item: i64,
    items: ModuleItems,
    bulletin: Option<i64>,
}

#[derive(Debug)]
struct GroupDoc {
    id: i64,
    name: String,
    members: Vec<GroupMember>,
    require_approval: bool,
    direct: bool,
    modules: Vec<i64>,
    modified_at: i64,
}

#[derive(Default)]
struct Documents {
    next_id: i64,
    accounts: HashMap<i64, Account>,
    emails: HashMap<String, i64>,
    groups: HashMap<i64, GroupDoc>,
    modules: HashMap<i64, ModuleDoc>,
    invites: HashMap<i64, Vec<Invite>>,
    links: HashMap<String, InviteLink>,
}

impl Documents {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn group(&self, group: i64) -> Result<&GroupDoc, StorageError> {
        self.groups.get(&group).ok_or(StorageError::Missing)
    }

    fn group_mut(&mut self, group: i64) -> Result<&mut GroupDoc, StorageError> {
        self.groups.get_mut(&group).ok_or(StorageError::Missing)
    }

    fn member(&self, group: i64, user: i64) -> Result<&GroupMember, StorageError> {
        self.group(group)?
            .members
            .iter()
            .find(|m| m.user == user)
            .ok_or(StorageError::Invalid)
    }

    fn module(
        &self,
        kind: &ModuleKind,
        module: i64,
        group: i64,
    ) -> Result<&ModuleDoc, StorageError> {
        let doc = self.modules.get(&module).ok_or(StorageError::Missing)?;
        if doc.group != group || doc.kind != *kind {
            return Err(StorageError::Invalid);
        }
        Ok(doc)
    }

    fn module_mut(
        &mut self,
        kind: &ModuleKind,
        module: i64,
        group: i64,
    ) -> Result<&mut ModuleDoc, StorageError> {
        let doc = self.modules.get_mut(&module).ok_or(StorageError::Missing)?;
        if doc.group != group || doc.kind != *kind {
            return Err(StorageError::Invalid);
        }
        Ok(doc)
    }

    fn name_of(&self, user: i64) -> String {
        self.accounts
            .get(&user)
            .map(|a| a.name.clone())
            .unwrap_or_default()
    }

    fn user_infos(&self, group: &GroupDoc) -> Vec<UserInfo> {
        group
            .members
            .iter()
            .map(|m| UserInfo {
                id: m.user,
                name: self.name_of(m.user),
                role: m.role,
                muted: m.muted,
            })
            .collect()
    }

    fn module_summaries(&self, group: &GroupDoc) -> Vec<ModuleSummary> {
        group
            .modules
            .iter()
            .filter_map(|id| self.modules.get(id))
            .map(|m| ModuleSummary {
                id: m.id,
                name: m.name.clone(),
                kind: m.kind.label().to_string(),
                enabled: m.enabled,
            })
            .collect()
    }

    fn touch(&mut self, group: i64) {
        if let Some(doc) = self.groups.get_mut(&group) {
            doc.modified_at = now_millis();
        }
    }

    /// Removes a group with everything hanging off it: modules and their
    /// items, pending invites, and invite links.
    fn delete_group(&mut self, group: i64) {
        if let Some(doc) = self.groups.remove(&group) {
            for module in doc.modules {
                self.modules.remove(&module);
            }
        }
        for invites in self.invites.values_mut() {
            invites.retain(|invite| invite.group != group);
        }
        self.invites.retain(|_, invites| !invites.is_empty());
        self.links.retain(|_, link| link.group != group);
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Document-oriented store for the protocol engine. Every operation takes
/// the single document lock once, so cross-record updates (owner transfer,
/// last-member cascade) are atomic from the caller's point of view.
pub struct Store {
    documents: RwLock<Documents>,
}

impl Default for Store {
    fn default() -> Self {
        Self::open()
    }
}

impl Store {
    pub fn open() -> Store {
        Store {
            documents: RwLock::new(Documents::default()),
        }
    }

    /// Lifecycle hook for backends that prepare external resources.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Lifecycle hook for backends that hold external resources.
    pub async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    // ── accounts ────────────────────────────────────────────────

    pub async fn lookup_account(&self, email: &str) -> Result<Account, StorageError> {
        let docs = self.documents.read().await;
        let id = docs.emails.get(email).ok_or(StorageError::Missing)?;
        docs.accounts.get(id).cloned().ok_or(StorageError::Missing)
    }

    pub async fn create_account(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<Account, StorageError> {
        let mut docs = self.documents.write().await;
        if docs.emails.contains_key(email) {
            return Err(StorageError::Duplicate);
        }
        let id = docs.allocate_id();
        let account = Account {
            id,
            email: email.to_string(),
            name: name.to_string(),
            password_hash: password_hash.to_string(),
            two_factor: false,
            auth_token: None,
        };
        docs.emails.insert(email.to_string(), id);
        docs.accounts.insert(id, account.clone());
        Ok(account)
    }

    pub async fn reset_password(&self, user: i64, hash: &str) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let account = docs.accounts.get_mut(&user).ok_or(StorageError::Missing)?;
        account.password_hash = hash.to_string();
        Ok(())
    }

    pub async fn get_two_factor(&self, user: i64) -> Result<bool, StorageError> {
        let docs = self.documents.read().await;
        docs.accounts
            .get(&user)
            .map(|a| a.two_factor)
            .ok_or(StorageError::Missing)
    }

    pub async fn set_two_factor(&self, user: i64, enabled: bool) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let account = docs.accounts.get_mut(&user).ok_or(StorageError::Missing)?;
        account.two_factor = enabled;
        Ok(())
    }

    pub async fn get_auth_token(&self, user: i64) -> Result<Option<String>, StorageError> {
        let docs = self.documents.read().await;
        docs.accounts
            .get(&user)
            .map(|a| a.auth_token.clone())
            .ok_or(StorageError::Missing)
    }

    pub async fn set_auth_token(&self, user: i64, token: &str) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let account = docs.accounts.get_mut(&user).ok_or(StorageError::Missing)?;
        account.auth_token = Some(token.to_string());
        Ok(())
    }

    pub async fn get_user_name(&self, user: i64) -> Result<String, StorageError> {
        let docs = self.documents.read().await;
        docs.accounts
            .get(&user)
            .map(|a| a.name.clone())
            .ok_or(StorageError::Missing)
    }

    // ── groups and membership ───────────────────────────────────

    pub async fn create_group(&self, owner: i64, name: &str) -> Result<i64, StorageError> {
        let mut docs = self.documents.write().await;
        if !docs.accounts.contains_key(&owner) {
            return Err(StorageError::Missing);
        }
        let id = docs.allocate_id();
        docs.groups.insert(
            id,
            GroupDoc {
                id,
                name: name.to_string(),
                members: vec![GroupMember {
                    user: owner,
                    role: Role::Owner,
                    muted: false,
                }],
                require_approval: false,
                direct: false,
                modules: Vec::new(),
                modified_at: now_millis(),
            },
        );
        Ok(id)
    }

    /// Creates a group under `parent` with a subset of its members. The new
    /// group inherits `require_approval`; the actor becomes its owner.
    pub async fn create_sub_group(
        &self,
        owner: i64,
        parent: i64,
        name: &str,
        users: &[i64],
    ) -> Result<i64, StorageError> {
        let mut docs = self.documents.write().await;
        let parent_doc = docs.group(parent)?;
        let require_approval = parent_doc.require_approval;
        let mut members = vec![GroupMember {
            user: owner,
            role: Role::Owner,
            muted: false,
        }];
        for user in users {
            if *user == owner {
                continue;
            }
            if !parent_doc.members.iter().any(|m| m.user == *user) {
                return Err(StorageError::Invalid);
            }
            if members.iter().any(|m| m.user == *user) {
                continue;
            }
            members.push(GroupMember {
                user: *user,
                role: Role::User,
                muted: false,
            });
        }
        let id = docs.allocate_id();
        docs.groups.insert(
            id,
            GroupDoc {
                id,
                name: name.to_string(),
                members,
                require_approval,
                direct: false,
                modules: Vec::new(),
                modified_at: now_millis(),
            },
        );
        Ok(id)
    }

    pub async fn get_groups(&self, user: i64) -> Result<Vec<GroupSummary>, StorageError> {
        let docs = self.documents.read().await;
        let mut groups: Vec<GroupSummary> = docs
            .groups
            .values()
            .filter(|g| g.members.iter().any(|m| m.user == user))
            .map(|g| GroupSummary {
                id: g.id,
                name: g.name.clone(),
            })
            .collect();
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }

    /// Detailed view of the requested groups, membership-filtered. Groups
    /// not modified since `last_refresh` are skipped.
    pub async fn get_group_info(
        &self,
        user: i64,
        groups: &[i64],
        last_refresh: i64,
    ) -> Result<Vec<GroupInfo>, StorageError> {
        let docs = self.documents.read().await;
        let mut infos = Vec::new();
        for id in groups {
            let Some(group) = docs.groups.get(id) else {
                continue;
            };
            if !group.members.iter().any(|m| m.user == user) {
                continue;
            }
            if group.modified_at <= last_refresh {
                continue;
            }
            infos.push(GroupInfo {
                id: group.id,
                name: group.name.clone(),
                require_approval: group.require_approval,
                direct: group.direct,
                modified: group.modified_at,
                users: docs.user_infos(group),
                modules: docs.module_summaries(group),
            });
        }
        Ok(infos)
    }

    pub async fn check_user_in_group(&self, user: i64, group: i64) -> Result<(), StorageError> {
        let docs = self.documents.read().await;
        docs.member(group, user).map(|_| ())
    }

    pub async fn check_module_in_group(
        &self,
        kind: &ModuleKind,
        module: i64,
        group: i64,
    ) -> Result<(), StorageError> {
        let docs = self.documents.read().await;
        docs.module(kind, module, group).map(|_| ())
    }

    pub async fn get_role(&self, group: i64, user: i64) -> Result<Role, StorageError> {
        let docs = self.documents.read().await;
        docs.member(group, user).map(|m| m.role)
    }

    pub async fn get_muted(&self, group: i64, user: i64) -> Result<bool, StorageError> {
        let docs = self.documents.read().await;
        docs.member(group, user).map(|m| m.muted)
    }

    pub async fn get_users(&self, group: i64) -> Result<Vec<UserInfo>, StorageError> {
        let docs = self.documents.read().await;
        let group = docs.group(group)?;
        Ok(docs.user_infos(group))
    }

    pub async fn get_user_info(&self, group: i64, user: i64) -> Result<UserInfo, StorageError> {
        let docs = self.documents.read().await;
        let member = docs.member(group, user)?;
        Ok(UserInfo {
            id: member.user,
            name: docs.name_of(member.user),
            role: member.role,
            muted: member.muted,
        })
    }

    pub async fn get_group_name(&self, group: i64) -> Result<String, StorageError> {
        let docs = self.documents.read().await;
        docs.group(group).map(|g| g.name.clone())
    }

    pub async fn get_require_approval(&self, group: i64) -> Result<bool, StorageError> {
        let docs = self.documents.read().await;
        docs.group(group).map(|g| g.require_approval)
    }

    pub async fn set_require_approval(
        &self,
        group: i64,
        require: bool,
    ) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        docs.group_mut(group)?.require_approval = require;
        docs.touch(group);
        Ok(())
    }

    /// Removes the actor from the group. The owner may only leave as the
    /// sole member, which deletes the group and everything in it.
    pub async fn leave_group(&self, user: i64, group: i64) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let (role, member_count) = {
            let doc = docs.group(group)?;
            let member = doc
                .members
                .iter()
                .find(|m| m.user == user)
                .ok_or(StorageError::Invalid)?;
            (member.role, doc.members.len())
        };
        if member_count == 1 {
            docs.delete_group(group);
            return Ok(());
        }
        if role == Role::Owner {
            return Err(StorageError::Invalid);
        }
        docs.group_mut(group)?.members.retain(|m| m.user != user);
        docs.touch(group);
        Ok(())
    }

    pub async fn kick(&self, group: i64, target: i64) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.group_mut(group)?;
        if !doc.members.iter().any(|m| m.user == target) {
            return Err(StorageError::Invalid);
        }
        doc.members.retain(|m| m.user != target);
        docs.touch(group);
        Ok(())
    }

    /// Assigns a role. Granting `owner` demotes the previous owner to
    /// moderator in the same update, so exactly one owner exists at every
    /// observable point.
    pub async fn set_role(&self, group: i64, target: i64, role: Role) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.group_mut(group)?;
        if !doc.members.iter().any(|m| m.user == target) {
            return Err(StorageError::Invalid);
        }
        if role == Role::Owner {
            for member in doc.members.iter_mut() {
                if member.role == Role::Owner {
                    member.role = Role::Moderator;
                }
            }
        }
        for member in doc.members.iter_mut() {
            if member.user == target {
                member.role = role;
            }
        }
        docs.touch(group);
        Ok(())
    }

    pub async fn set_muted(&self, group: i64, target: i64, muted: bool) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.group_mut(group)?;
        let member = doc
            .members
            .iter_mut()
            .find(|m| m.user == target)
            .ok_or(StorageError::Invalid)?;
        member.muted = muted;
        docs.touch(group);
        Ok(())
    }

    // ── invites and invite links ────────────────────────────────

    pub async fn add_group_invite_code(
        &self,
        group: i64,
        code: &str,
        expire_at: i64,
    ) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.group(group)?;
        if doc.direct {
            return Err(StorageError::Invalid);
        }
        if docs.links.contains_key(code) {
            return Err(StorageError::Duplicate);
        }
        docs.links.insert(
            code.to_string(),
            InviteLink {
                code: code.to_string(),
                group,
                expire_at,
            },
        );
        Ok(())
    }

    pub async fn check_invite_code(&self, code: &str) -> Result<InviteLink, StorageError> {
        let docs = self.documents.read().await;
        docs.links.get(code).cloned().ok_or(StorageError::Missing)
    }

    /// Adds the user as a regular member; joining a group twice is a no-op.
    pub async fn join_group(&self, user: i64, group: i64) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        if !docs.accounts.contains_key(&user) {
            return Err(StorageError::Missing);
        }
        let doc = docs.group_mut(group)?;
        if doc.direct {
            return Err(StorageError::Invalid);
        }
        if doc.members.iter().any(|m| m.user == user) {
            return Ok(());
        }
        doc.members.push(GroupMember {
            user,
            role: Role::User,
            muted: false,
        });
        docs.touch(group);
        Ok(())
    }

    /// Records an invite for the target. Returns the stored invite, or
    /// `None` when an identical invite is already pending.
    pub async fn send_invite(
        &self,
        target: i64,
        group: i64,
        inviter: i64,
    ) -> Result<Option<Invite>, StorageError> {
        let mut docs = self.documents.write().await;
        if !docs.accounts.contains_key(&target) {
            return Err(StorageError::Missing);
        }
        let doc = docs.group(group)?;
        if doc.direct || doc.members.iter().any(|m| m.user == target) {
            return Err(StorageError::Invalid);
        }
        let invite = Invite {
            group,
            group_name: doc.name.clone(),
            inviter_name: docs.name_of(inviter),
        };
        let pending = docs.invites.entry(target).or_default();
        if pending.iter().any(|i| i.group == group) {
            return Ok(None);
        }
        pending.push(invite.clone());
        Ok(Some(invite))
    }

    pub async fn get_invites(&self, user: i64) -> Result<Vec<Invite>, StorageError> {
        let docs = self.documents.read().await;
        Ok(docs.invites.get(&user).cloned().unwrap_or_default())
    }

    pub async fn reply_to_invite(
        &self,
        user: i64,
        group: i64,
        accept: bool,
    ) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let pending = docs.invites.get_mut(&user).ok_or(StorageError::Invalid)?;
        let before = pending.len();
        pending.retain(|i| i.group != group);
        if pending.len() == before {
            return Err(StorageError::Invalid);
        }
        if pending.is_empty() {
            docs.invites.remove(&user);
        }
        if !accept {
            return Ok(());
        }
        let doc = docs.group_mut(group)?;
        if !doc.members.iter().any(|m| m.user == user) {
            doc.members.push(GroupMember {
                user,
                role: Role::User,
                muted: false,
            });
        }
        docs.touch(group);
        Ok(())
    }

    // ── modules ─────────────────────────────────────────────────

    pub async fn create_module(
        &self,
        group: i64,
        name: &str,
        kind: ModuleKind,
    ) -> Result<i64, StorageError> {
        let mut docs = self.documents.write().await;
        docs.group(group)?;
        let id = docs.allocate_id();
        let items = ModuleItems::for_kind(&kind);
        docs.modules.insert(
            id,
            ModuleDoc {
                id,
                group,
                name: name.to_string(),
                kind,
                enabled: true,
                next_item: 1,
                items,
                bulletin: None,
            },
        );
        docs.group_mut(group)?.modules.push(id);
        docs.touch(group);
        Ok(id)
    }

    pub async fn get_modules(&self, group: i64) -> Result<Vec<i64>, StorageError> {
        let docs = self.documents.read().await;
        docs.group(group).map(|g| g.modules.clone())
    }

    pub async fn get_module_info(&self, group: i64) -> Result<Vec<ModuleSummary>, StorageError> {
        let docs = self.documents.read().await;
        let group = docs.group(group)?;
        Ok(docs.module_summaries(group))
    }

    pub async fn set_module_enabled(
        &self,
        group: i64,
        module: i64,
        enabled: bool,
    ) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.modules.get_mut(&module).ok_or(StorageError::Missing)?;
        if doc.group != group {
            return Err(StorageError::Invalid);
        }
        doc.enabled = enabled;
        docs.touch(group);
        Ok(())
    }

    // ── messages ────────────────────────────────────────────────

    pub async fn send_message(
        &self,
        group: i64,
        module: i64,
        sender: i64,
        contents: &str,
    ) -> Result<Message, StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Chat, module, group)?;
        let id = doc.next_item;
        doc.next_item += 1;
        let message = Message {
            id,
            sender,
            timestamp: now_millis(),
            contents: contents.to_string(),
            reactions: Vec::new(),
        };
        let ModuleItems::Messages(messages) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        messages.push(message.clone());
        Ok(message)
    }

    /// Messages with ids strictly between `after` and `before`, at most
    /// [`MESSAGE_PAGE`] most-recent entries, in ascending id order.
    pub async fn get_messages(
        &self,
        group: i64,
        module: i64,
        after: i64,
        before: i64,
    ) -> Result<Vec<Message>, StorageError> {
        let docs = self.documents.read().await;
        let doc = docs.module(&ModuleKind::Chat, module, group)?;
        let ModuleItems::Messages(messages) = &doc.items else {
            return Err(StorageError::Invalid);
        };
        let matching: Vec<&Message> = messages
            .iter()
            .filter(|m| m.id > after && m.id < before)
            .collect();
        let skip = matching.len().saturating_sub(MESSAGE_PAGE);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }

    pub async fn get_message(
        &self,
        group: i64,
        module: i64,
        id: i64,
    ) -> Result<Message, StorageError> {
        let docs = self.documents.read().await;
        let doc = docs.module(&ModuleKind::Chat, module, group)?;
        let ModuleItems::Messages(messages) = &doc.items else {
            return Err(StorageError::Invalid);
        };
        messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or(StorageError::Missing)
    }

    pub async fn edit_message(
        &self,
        group: i64,
        module: i64,
        id: i64,
        contents: &str,
    ) -> Result<Message, StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Chat, module, group)?;
        let ModuleItems::Messages(messages) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StorageError::Missing)?;
        message.contents = contents.to_string();
        if contents.is_empty() {
            message.reactions.clear();
        }
        Ok(message.clone())
    }

    pub async fn get_reactions(
        &self,
        group: i64,
        module: i64,
        id: i64,
    ) -> Result<Vec<Reaction>, StorageError> {
        self.get_message(group, module, id)
            .await
            .map(|m| m.reactions)
    }

    /// Sets or clears the caller's reaction; each user holds at most one
    /// reaction per message. Returns the updated reaction list.
    pub async fn set_reaction(
        &self,
        group: i64,
        module: i64,
        id: i64,
        user: i64,
        reaction: Option<&str>,
    ) -> Result<Vec<Reaction>, StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Chat, module, group)?;
        let ModuleItems::Messages(messages) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StorageError::Missing)?;
        message.reactions.retain(|r| r.user != user);
        if let Some(reaction) = reaction {
            message.reactions.push(Reaction {
                user,
                reaction: reaction.to_string(),
            });
        }
        Ok(message.reactions.clone())
    }

    // ── tasks ───────────────────────────────────────────────────

    pub async fn create_task(
        &self,
        group: i64,
        module: i64,
        author: i64,
        deadline: i64,
        description: &str,
    ) -> Result<TaskItem, StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Task, module, group)?;
        let id = doc.next_item;
        doc.next_item += 1;
        let task = TaskItem {
            id,
            author,
            created: now_millis(),
            deadline,
            description: description.to_string(),
            completed: false,
        };
        let ModuleItems::Tasks(tasks) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        tasks.push(task.clone());
        Ok(task)
    }

    pub async fn get_tasks(&self, group: i64, module: i64) -> Result<Vec<TaskItem>, StorageError> {
        let docs = self.documents.read().await;
        let doc = docs.module(&ModuleKind::Task, module, group)?;
        let ModuleItems::Tasks(tasks) = &doc.items else {
            return Err(StorageError::Invalid);
        };
        Ok(tasks.clone())
    }

    pub async fn update_task_status(
        &self,
        group: i64,
        module: i64,
        id: i64,
        completed: bool,
    ) -> Result<TaskItem, StorageError> {
        self.update_task(group, module, id, |task| task.completed = completed)
            .await
    }

    pub async fn update_task_deadline(
        &self,
        group: i64,
        module: i64,
        id: i64,
        deadline: i64,
    ) -> Result<TaskItem, StorageError> {
        self.update_task(group, module, id, |task| task.deadline = deadline)
            .await
    }

    async fn update_task(
        &self,
        group: i64,
        module: i64,
        id: i64,
        apply: impl FnOnce(&mut TaskItem),
    ) -> Result<TaskItem, StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Task, module, group)?;
        let ModuleItems::Tasks(tasks) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StorageError::Missing)?;
        apply(task);
        Ok(task.clone())
    }

    pub async fn delete_task(&self, group: i64, module: i64, id: i64) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Task, module, group)?;
        let ModuleItems::Tasks(tasks) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        if tasks.len() == before {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    // ── events ──────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_event(
        &self,
        group: i64,
        module: i64,
        author: i64,
        description: &str,
        start: i64,
        end: i64,
        approved: bool,
    ) -> Result<EventItem, StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Calendar, module, group)?;
        let id = doc.next_item;
        doc.next_item += 1;
        let event = EventItem {
            id,
            author,
            description: description.to_string(),
            start,
            end,
            approved,
        };
        let ModuleItems::Events(events) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        events.push(event.clone());
        Ok(event)
    }

    pub async fn get_events(
        &self,
        group: i64,
        module: i64,
    ) -> Result<Vec<EventItem>, StorageError> {
        let docs = self.documents.read().await;
        let doc = docs.module(&ModuleKind::Calendar, module, group)?;
        let ModuleItems::Events(events) = &doc.items else {
            return Err(StorageError::Invalid);
        };
        Ok(events.clone())
    }

    pub async fn get_event(
        &self,
        group: i64,
        module: i64,
        id: i64,
    ) -> Result<EventItem, StorageError> {
        let docs = self.documents.read().await;
        let doc = docs.module(&ModuleKind::Calendar, module, group)?;
        let ModuleItems::Events(events) = &doc.items else {
            return Err(StorageError::Invalid);
        };
        events
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(StorageError::Missing)
    }

    pub async fn approve_event(
        &self,
        group: i64,
        module: i64,
        id: i64,
    ) -> Result<EventItem, StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Calendar, module, group)?;
        let ModuleItems::Events(events) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        let event = events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StorageError::Missing)?;
        event.approved = true;
        Ok(event.clone())
    }

    pub async fn edit_event(
        &self,
        group: i64,
        module: i64,
        id: i64,
        description: &str,
        start: i64,
        end: i64,
    ) -> Result<EventItem, StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Calendar, module, group)?;
        let ModuleItems::Events(events) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        let event = events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StorageError::Missing)?;
        event.description = description.to_string();
        event.start = start;
        event.end = end;
        Ok(event.clone())
    }

    pub async fn delete_event(&self, group: i64, module: i64, id: i64) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Calendar, module, group)?;
        let ModuleItems::Events(events) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        let before = events.len();
        events.retain(|e| e.id != id);
        if events.len() == before {
            return Err(StorageError::Missing);
        }
        if doc.bulletin == Some(id) {
            doc.bulletin = None;
        }
        Ok(())
    }

    /// Pins one event as the calendar bulletin, or clears the pin.
    pub async fn set_bulletin_event(
        &self,
        group: i64,
        module: i64,
        event: Option<i64>,
    ) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Calendar, module, group)?;
        if let Some(id) = event {
            let ModuleItems::Events(events) = &doc.items else {
                return Err(StorageError::Invalid);
            };
            if !events.iter().any(|e| e.id == id) {
                return Err(StorageError::Missing);
            }
        }
        doc.bulletin = event;
        Ok(())
    }

    pub async fn get_bulletin_event(
        &self,
        group: i64,
        module: i64,
    ) -> Result<Option<i64>, StorageError> {
        let docs = self.documents.read().await;
        let doc = docs.module(&ModuleKind::Calendar, module, group)?;
        Ok(doc.bulletin)
    }

    // ── polls ───────────────────────────────────────────────────

    pub async fn create_poll(
        &self,
        group: i64,
        module: i64,
        author: i64,
        description: &str,
        options: &[String],
    ) -> Result<PollItem, StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Poll, module, group)?;
        let id = doc.next_item;
        doc.next_item += 1;
        let poll = PollItem {
            id,
            author,
            description: description.to_string(),
            options: options.to_vec(),
            votes: HashMap::new(),
        };
        let ModuleItems::Polls(polls) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        polls.push(poll.clone());
        Ok(poll)
    }

    pub async fn get_polls(&self, group: i64, module: i64) -> Result<Vec<PollItem>, StorageError> {
        let docs = self.documents.read().await;
        let doc = docs.module(&ModuleKind::Poll, module, group)?;
        let ModuleItems::Polls(polls) = &doc.items else {
            return Err(StorageError::Invalid);
        };
        Ok(polls.clone())
    }

    /// Records the user's vote; voting again replaces the earlier choice.
    pub async fn vote(
        &self,
        group: i64,
        module: i64,
        poll: i64,
        user: i64,
        option: usize,
    ) -> Result<(), StorageError> {
        let mut docs = self.documents.write().await;
        let doc = docs.module_mut(&ModuleKind::Poll, module, group)?;
        let ModuleItems::Polls(polls) = &mut doc.items else {
            return Err(StorageError::Invalid);
        };
        let poll = polls
            .iter_mut()
            .find(|p| p.id == poll)
            .ok_or(StorageError::Missing)?;
        if option >= poll.options.len() {
            return Err(StorageError::Invalid);
        }
        poll.votes.insert(user, option);
        Ok(())
    }

    // ── direct conversations ────────────────────────────────────

    /// Returns the direct conversation between the two users, creating it
    /// (with one chat module) on first use. The boolean reports creation.
    pub async fn create_direct_message(
        &self,
        actor: i64,
        target: i64,
    ) -> Result<(i64, bool), StorageError> {
        let mut docs = self.documents.write().await;
        if !docs.accounts.contains_key(&actor) || !docs.accounts.contains_key(&target) {
            return Err(StorageError::Missing);
        }
        if actor == target {
            return Err(StorageError::Invalid);
        }
        let existing = docs.groups.values().find(|g| {
            g.direct
                && g.members.len() == 2
                && g.members.iter().any(|m| m.user == actor)
                && g.members.iter().any(|m| m.user == target)
        });
        if let Some(group) = existing {
            return Ok((group.id, false));
        }
        let name = format!("{} & {}", docs.name_of(actor), docs.name_of(target));
        let group = docs.allocate_id();
        let module = docs.allocate_id();
        docs.groups.insert(
            group,
            GroupDoc {
                id: group,
                name,
                members: vec![
                    GroupMember {
                        user: actor,
                        role: Role::Owner,
                        muted: false,
                    },
                    GroupMember {
                        user: target,
                        role: Role::Moderator,
                        muted: false,
                    },
                ],
                require_approval: false,
                direct: true,
                modules: vec![module],
                modified_at: now_millis(),
            },
        );
        docs.modules.insert(
            module,
            ModuleDoc {
                id: module,
                group,
                name: String::from("chat"),
                kind: ModuleKind::Chat,
                enabled: true,
                next_item: 1,
                items: ModuleItems::Messages(Vec::new()),
                bulletin: None,
            },
        );
        Ok((group, true))
    }
}
