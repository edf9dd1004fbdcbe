use std::collections::HashMap;

use crate::config::UserConfig;
use crate::protocol::handshake::scramble_from_stage1;
use crate::protocol::{stage1_hash, verify_auth_response};

/// Hashed credential of one account.
///
/// SHA1(password) is enough to verify a client scramble and to answer a
/// backend challenge, so plaintext passwords are not kept.
#[derive(Debug, Clone)]
pub struct Credential {
    /// `None` for an empty password
    stage1: Option<[u8; 20]>,
}

impl Credential {
    pub fn from_password(password: &str) -> Self {
        Self {
            stage1: (!password.is_empty()).then(|| stage1_hash(password)),
        }
    }

    pub fn verify(&self, salt: &[u8], response: &[u8]) -> bool {
        verify_auth_response(self.stage1.as_ref(), salt, response)
    }

    /// Auth response to a server challenge
    pub fn scramble(&self, salt: &[u8]) -> Vec<u8> {
        match &self.stage1 {
            Some(stage1) => scramble_from_stage1(stage1, salt),
            None => Vec::new(),
        }
    }
}

/// Username to credential lookup
#[derive(Debug, Default, Clone)]
pub struct CredentialStore {
    users: HashMap<String, Credential>,
}

impl CredentialStore {
    pub fn new(users: &[UserConfig]) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| (u.name.clone(), Credential::from_password(&u.password)))
                .collect(),
        }
    }

    pub fn get(&self, user: &str) -> Option<&Credential> {
        self.users.get(user)
    }

    /// Any configured user (lowest name), used by background probes
    pub fn first_user(&self) -> Option<&str> {
        self.users.keys().min().map(String::as_str)
    }
}
