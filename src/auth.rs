//! Credential resolution for remote operations.
//!
//! libgit2 asks for credentials through a callback, possibly several times per
//! connection as it walks the authentication methods the server offers. Each
//! request is answered from the source's declared [`SourceAuth`]:
//!
//! - SSH: in-memory key pair, no passphrase
//! - Token: user `git` with the token as password
//! - None: the username embedded in the URL, no secret

use git2::{Cred, FetchOptions, RemoteCallbacks};

use crate::types::SourceAuth;

/// Username used for token auth and for SSH when the URL carries none.
pub const TOKEN_USERNAME: &str = "git";

/// Credential requests answered before giving up on a connection.
///
/// libgit2 re-invokes the callback after a rejected attempt; without a cap a
/// wrong key or token loops forever.
const MAX_CREDENTIAL_ATTEMPTS: usize = 3;

/// Transport credentials resolved for a single request.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSpec {
    SshKey {
        username: String,
        public_key: Option<String>,
        private_key: String,
    },
    UserPass {
        username: String,
        password: String,
    },
    Anonymous {
        username: Option<String>,
    },
}

// Manual impl keeps key material and tokens out of logs.
impl std::fmt::Debug for CredentialSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSpec::SshKey { username, .. } => f
                .debug_struct("SshKey")
                .field("username", username)
                .finish_non_exhaustive(),
            CredentialSpec::UserPass { username, .. } => f
                .debug_struct("UserPass")
                .field("username", username)
                .finish_non_exhaustive(),
            CredentialSpec::Anonymous { username } => f
                .debug_struct("Anonymous")
                .field("username", username)
                .finish(),
        }
    }
}

/// Map a source's auth declaration to credentials for one request.
pub fn resolve_credentials(auth: &SourceAuth, username_from_url: Option<&str>) -> CredentialSpec {
    match auth {
        SourceAuth::Ssh {
            public_key,
            private_key,
        } => CredentialSpec::SshKey {
            username: username_from_url.unwrap_or(TOKEN_USERNAME).to_string(),
            public_key: public_key.clone().filter(|key| !key.is_empty()),
            private_key: private_key.clone(),
        },
        SourceAuth::Token { value } => CredentialSpec::UserPass {
            username: TOKEN_USERNAME.to_string(),
            password: value.clone(),
        },
        SourceAuth::None => CredentialSpec::Anonymous {
            username: username_from_url.map(str::to_string),
        },
    }
}

impl CredentialSpec {
    /// Build the libgit2 credential object.
    pub fn into_cred(self) -> Result<Cred, git2::Error> {
        match self {
            CredentialSpec::SshKey {
                username,
                public_key,
                private_key,
            } => Cred::ssh_key_from_memory(&username, public_key.as_deref(), &private_key, None),
            CredentialSpec::UserPass { username, password } => {
                Cred::userpass_plaintext(&username, &password)
            }
            CredentialSpec::Anonymous {
                username: Some(username),
            } => Cred::username(&username),
            CredentialSpec::Anonymous { username: None } => Cred::default(),
        }
    }
}

/// Remote callbacks answering credential requests for `auth`.
pub fn remote_callbacks(auth: &SourceAuth) -> RemoteCallbacks<'_> {
    let mut attempts = 0usize;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            log::warn!(
                "giving up on credentials for {} after {} attempts",
                url,
                MAX_CREDENTIAL_ATTEMPTS
            );
            return Err(git2::Error::from_str("authentication failed"));
        }
        let spec = resolve_credentials(auth, username_from_url);
        log::debug!(
            "supplying {} credentials for {} (allowed: {:?})",
            auth.kind(),
            url,
            allowed
        );
        spec.into_cred()
    });
    callbacks
}

/// Fetch options carrying the credential callbacks for `auth`.
pub fn fetch_options(auth: &SourceAuth) -> FetchOptions<'_> {
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks(auth));
    options
}
