//! SSL negotiation and the startup handshake.

use super::config::{ConnectOptions, SslMode};
use super::socket::PacketSocket;
use super::stream::PgStream;
use super::tls::server_name;
use super::{PgError, PgResult};
use crate::protocol::{BackendMessage, RequestBuilder, TransactionStatus};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};

/// Send an SSLRequest when the mode asks for one and upgrade on 'S'.
pub(crate) async fn negotiate_tls(
    mut socket: PacketSocket<PgStream>,
    options: &ConnectOptions,
) -> PgResult<PacketSocket<PgStream>> {
    if options.ssl_mode == SslMode::Disable || options.host.starts_with('/') {
        return Ok(socket);
    }
    tracing::debug!("Startup state: {:?}", StartupState::AwaitingSslDecision);
    let mut builder = RequestBuilder::with_capacity(8);
    builder.ssl_request()?;
    socket.send(builder.outstanding()).await?;

    if socket.read_ssl_response().await? {
        let connector = options.tls.connector()?;
        let name = server_name(&options.host)?;
        let socket = socket.switch_to_tls(&connector, name).await?;
        tracing::debug!("TLS established with {}", options.host);
        return Ok(socket);
    }
    match options.ssl_mode {
        SslMode::Require => Err(PgError::Connection(
            "Server does not support TLS".to_string(),
        )),
        _ => {
            tracing::debug!("Server declined TLS, continuing in plaintext");
            Ok(socket)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartupState {
    AwaitingSslDecision,
    AwaitingAuthentication,
    AwaitingReady,
    Ready,
    Failed,
}

/// Startup message loop, fed one backend message at a time.
#[derive(Debug)]
pub(crate) struct Handshake {
    pub(crate) state: StartupState,
    pub(crate) server_params: HashMap<String, String>,
    pub(crate) backend_key: Option<(i32, Vec<u8>)>,
    pub(crate) tx_status: TransactionStatus,
    pub(crate) protocol_minor: i32,
}

impl Handshake {
    pub(crate) fn new(requested_minor: i32) -> Self {
        Self {
            state: StartupState::AwaitingAuthentication,
            server_params: HashMap::new(),
            backend_key: None,
            tx_status: TransactionStatus::Idle,
            protocol_minor: requested_minor,
        }
    }

    /// Send the StartupMessage and process replies until ReadyForQuery.
    pub(crate) async fn run<S>(
        socket: &mut PacketSocket<S>,
        builder: &mut RequestBuilder,
        options: &ConnectOptions,
    ) -> PgResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut params = vec![("user", options.user.as_str())];
        if let Some(database) = &options.database {
            params.push(("database", database.as_str()));
        }
        params.push(("client_encoding", "UTF8"));
        if let Some(name) = &options.application_name {
            params.push(("application_name", name.as_str()));
        }
        builder.startup(options.protocol_version.code(), &params)?;
        let sent = socket.send(builder.outstanding()).await;
        builder.acknowledge();
        sent?;

        let mut handshake = Self::new(options.protocol_version.minor());
        while handshake.state != StartupState::Ready {
            let packet = socket.read_packet().await?;
            let message =
                BackendMessage::decode(packet.code, packet.body).map_err(PgError::Protocol)?;
            handshake.step(message)?;
        }
        Ok(handshake)
    }

    pub(crate) fn step(&mut self, message: BackendMessage<'_>) -> PgResult<()> {
        let result = self.transition(message);
        if result.is_err() {
            self.state = StartupState::Failed;
        }
        result
    }

    fn transition(&mut self, message: BackendMessage<'_>) -> PgResult<()> {
        use StartupState::*;
        match (self.state, message) {
            (Ready | Failed, message) => Err(PgError::Protocol(format!(
                "Startup already finished, got {:?}",
                message
            ))),
            (_, BackendMessage::ErrorResponse(fields)) => Err(fields.into()),
            (_, BackendMessage::NoticeResponse(fields)) => {
                tracing::info!("Startup notice: {}", fields);
                Ok(())
            }
            (_, BackendMessage::ParameterStatus { name, value }) => {
                self.server_params.insert(name, value);
                Ok(())
            }
            (
                AwaitingAuthentication,
                BackendMessage::NegotiateProtocolVersion {
                    newest_minor,
                    unrecognized,
                },
            ) => {
                if !(0..=2).contains(&newest_minor) {
                    return Err(PgError::Protocol(format!(
                        "Server offered unsupported protocol version 3.{}",
                        newest_minor
                    )));
                }
                if !unrecognized.is_empty() {
                    tracing::warn!("Server did not recognize options: {:?}", unrecognized);
                }
                self.protocol_minor = newest_minor;
                Ok(())
            }
            (AwaitingAuthentication, BackendMessage::AuthenticationOk) => {
                self.state = AwaitingReady;
                tracing::debug!("Startup state: {:?}", self.state);
                Ok(())
            }
            (AwaitingAuthentication, BackendMessage::AuthenticationCleartextPassword) => {
                Err(unsupported("cleartext password"))
            }
            (AwaitingAuthentication, BackendMessage::AuthenticationMD5Password(_)) => {
                Err(unsupported("MD5 password"))
            }
            (AwaitingAuthentication, BackendMessage::AuthenticationSASL(mechanisms)) => {
                Err(unsupported(&format!("SASL ({})", mechanisms.join(", "))))
            }
            (AwaitingAuthentication, BackendMessage::AuthenticationOther(code)) => {
                Err(unsupported(&format!("code {}", code)))
            }
            (
                AwaitingReady,
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                },
            ) => {
                self.backend_key = Some((process_id, secret_key));
                Ok(())
            }
            (AwaitingReady, BackendMessage::ReadyForQuery(status)) => {
                self.tx_status = status;
                self.state = Ready;
                tracing::debug!("Startup state: {:?}", self.state);
                Ok(())
            }
            (state, message) => Err(PgError::Protocol(format!(
                "Unexpected message during startup ({:?}): {:?}",
                state, message
            ))),
        }
    }
}

fn unsupported(method: &str) -> PgError {
    PgError::Protocol(format!("Unsupported authentication method: {}", method))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorFields;

    fn ready(handshake: &mut Handshake) {
        handshake.step(BackendMessage::AuthenticationOk).unwrap();
        handshake
            .step(BackendMessage::ParameterStatus {
                name: "server_version".into(),
                value: "16.2".into(),
            })
            .unwrap();
        handshake
            .step(BackendMessage::BackendKeyData {
                process_id: 42,
                secret_key: vec![1, 2, 3, 4],
            })
            .unwrap();
        handshake
            .step(BackendMessage::ReadyForQuery(TransactionStatus::Idle))
            .unwrap();
    }

    #[test]
    fn test_trust_startup() {
        let mut handshake = Handshake::new(0);
        handshake
            .step(BackendMessage::NoticeResponse(ErrorFields::default()))
            .unwrap();
        ready(&mut handshake);
        assert_eq!(handshake.state, StartupState::Ready);
        assert_eq!(handshake.backend_key, Some((42, vec![1, 2, 3, 4])));
        assert_eq!(
            handshake.server_params.get("server_version").map(String::as_str),
            Some("16.2")
        );
    }

    #[test]
    fn test_password_methods_rejected() {
        for message in [
            BackendMessage::AuthenticationCleartextPassword,
            BackendMessage::AuthenticationMD5Password([1, 2, 3, 4]),
            BackendMessage::AuthenticationSASL(vec!["SCRAM-SHA-256".into()]),
        ] {
            let mut handshake = Handshake::new(0);
            let err = handshake.step(message).unwrap_err();
            assert!(err.to_string().contains("Unsupported authentication"), "{err}");
            assert_eq!(handshake.state, StartupState::Failed);
        }
    }

    #[test]
    fn test_protocol_negotiation_band() {
        let mut handshake = Handshake::new(2);
        handshake
            .step(BackendMessage::NegotiateProtocolVersion {
                newest_minor: 0,
                unrecognized: vec![],
            })
            .unwrap();
        assert_eq!(handshake.protocol_minor, 0);

        let mut handshake = Handshake::new(2);
        assert!(
            handshake
                .step(BackendMessage::NegotiateProtocolVersion {
                    newest_minor: 7,
                    unrecognized: vec![],
                })
                .is_err()
        );
    }

    #[test]
    fn test_error_response_fails_startup() {
        let mut handshake = Handshake::new(0);
        let err = handshake
            .step(BackendMessage::ErrorResponse(ErrorFields {
                severity: "FATAL".into(),
                code: "3D000".into(),
                message: "database \"nope\" does not exist".into(),
                ..Default::default()
            }))
            .unwrap_err();
        assert_eq!(err.code(), Some("3D000"));
        assert!(handshake.step(BackendMessage::AuthenticationOk).is_err());
    }

    #[test]
    fn test_out_of_order_messages() {
        let mut handshake = Handshake::new(0);
        assert!(
            handshake
                .step(BackendMessage::ReadyForQuery(TransactionStatus::Idle))
                .is_err()
        );
    }
}
