//! SSH agent client
//!
//! Thin wrapper over russh's [`AgentClient`] with a type-erased stream so
//! the same code drives the `SSH_AUTH_SOCK` Unix socket and the OpenSSH
//! named pipe on Windows. The agent holds the private halves; we list its
//! identities and delegate signing to it during authentication.

use russh::client::{AuthResult, Handle, Handler};
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::PublicKey;
use tracing::{debug, info};

use super::error::SshError;

pub struct SshAgentClient {
    agent: AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl SshAgentClient {
    /// Connect to the system SSH agent.
    pub async fn connect() -> Result<Self, SshError> {
        #[cfg(unix)]
        {
            debug!("Connecting to SSH agent via SSH_AUTH_SOCK");
            let agent = AgentClient::connect_env().await.map_err(|e| {
                SshError::Agent(format!(
                    "cannot connect to SSH agent: {}. \
                     Make sure SSH_AUTH_SOCK is set and ssh-agent is running.",
                    e
                ))
            })?;
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            debug!("Connecting to SSH agent via named pipe");
            let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
                .await
                .map_err(|e| {
                    SshError::Agent(format!(
                        "cannot connect to SSH agent named pipe: {}. \
                         Make sure the OpenSSH Authentication Agent service is running.",
                        e
                    ))
                })?;
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(SshError::Agent(
                "SSH agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Public keys the agent currently holds.
    pub async fn identities(&mut self) -> Result<Vec<PublicKey>, SshError> {
        self.agent
            .request_identities()
            .await
            .map_err(|e| SshError::Agent(format!("cannot list agent keys: {}", e)))
    }

    /// Offer one agent-held key to the server, signing through the agent.
    pub async fn authenticate_key<H: Handler>(
        &mut self,
        handle: &mut Handle<H>,
        username: &str,
        key: &PublicKey,
    ) -> Result<AuthResult, SshError> {
        debug!("Trying agent key {} ({})", key.algorithm(), key.comment());
        let result = handle
            .authenticate_publickey_with(username, key.clone(), None, &mut self.agent)
            .await
            .map_err(|e| SshError::Agent(e.to_string()))?;
        if result.success() {
            info!("Agent authentication succeeded with key {}", key.comment());
        }
        Ok(result)
    }
}

/// Quick environment pre-check; an actual connection may still fail.
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var("SSH_AUTH_SOCK").is_ok()
    }

    #[cfg(windows)]
    {
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_availability_check() {
        let available = is_agent_available();
        println!("Agent appears available: {}", available);
    }

    #[tokio::test]
    async fn connect_without_agent_is_an_agent_error() {
        // Passes both with and without a live agent; only the error shape
        // is pinned down.
        match SshAgentClient::connect().await {
            Ok(_) => {}
            Err(SshError::Agent(msg)) => assert!(msg.contains("agent")),
            Err(e) => panic!("unexpected error type: {:?}", e),
        }
    }
}
