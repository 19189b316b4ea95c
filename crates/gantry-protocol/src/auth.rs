//! 身份认证与访问控制协作方。

use crate::store::{ResourceStore, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Observer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "Admin",
            Self::User => "User",
            Self::Observer => "Observer",
        }
    }
}

/// 认证成功后会话持有的身份。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub timezone: String,
}

pub trait Authenticator: Send + Sync {
    /// 用户名或密码错误时返回 `Ok(None)`；`Err` 只表示协作方自身故障。
    fn authenticate(&self, username: &str, password: &str)
    -> Result<Option<Credentials>, StoreError>;
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, who: &Credentials, command: &str) -> bool;

    fn authorize_resource(
        &self,
        who: &Credentials,
        command: &str,
        resource_type: &str,
        id: &str,
    ) -> Result<bool, StoreError>;
}

/// 密码的 SHA-256 摘要（十六进制小写）。
pub fn digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub password_sha256: String,
    pub role: Role,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

/// 静态用户表：口令以 SHA-256 摘要保存。
#[derive(Clone, Debug, Default)]
pub struct UserTable {
    users: Vec<UserRecord>,
}

impl UserTable {
    pub fn new(users: Vec<UserRecord>) -> Self {
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// 不校验口令，按用户名取出身份；扫描工作进程以条目所有者的身份运行时使用。
    pub fn credentials_of(&self, username: &str) -> Option<Credentials> {
        self.users
            .iter()
            .find(|user| user.name == username)
            .map(UserRecord::credentials)
    }
}

impl UserRecord {
    fn credentials(&self) -> Credentials {
        Credentials {
            user_id: self.id.clone(),
            username: self.name.clone(),
            role: self.role,
            timezone: self.timezone.clone(),
        }
    }
}

impl Authenticator for UserTable {
    fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Credentials>, StoreError> {
        let offered = digest(password);
        Ok(self
            .users
            .iter()
            .find(|user| user.name == username)
            .filter(|user| user.password_sha256.eq_ignore_ascii_case(&offered))
            .map(UserRecord::credentials))
    }
}

/// 基于角色与属主的授权。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - `Observer` 只能执行只读命令（`get_*`、`help`）；
/// - `Admin` 可以操作任何资源；
/// - 其余角色只能操作自己名下的资源；资源不存在时放行，由后续查找给出 404。
pub struct RoleAuthorizer {
    store: Arc<dyn ResourceStore>,
}

impl RoleAuthorizer {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }
}

fn is_read_only(command: &str) -> bool {
    command.starts_with("get_") || command == "help"
}

impl Authorizer for RoleAuthorizer {
    fn authorize(&self, who: &Credentials, command: &str) -> bool {
        match who.role {
            Role::Admin | Role::User => true,
            Role::Observer => is_read_only(command),
        }
    }

    fn authorize_resource(
        &self,
        who: &Credentials,
        command: &str,
        resource_type: &str,
        id: &str,
    ) -> Result<bool, StoreError> {
        if !self.authorize(who, command) {
            return Ok(false);
        }
        if who.role == Role::Admin {
            return Ok(true);
        }
        if self.store.find(resource_type, id)?.is_none() {
            return Ok(true);
        }
        let owner = self.store.get_field(resource_type, id, "owner")?;
        Ok(owner.as_deref() == Some(who.username.as_str()))
    }
}
