//! Encrypted command/response pipelines over the frame transport.
//!
//! Outgoing: payload → optional CRC trailer → session encrypt → frames,
//! written sequentially with acknowledgment between frames. Incoming:
//! first frame from the target characteristic, continuation frames from
//! the extended-read characteristic, headers stripped, session decrypt,
//! optional CRC strip.
//!
//! Decrypt failures do not error out of the read path; they surface as
//! `None` with [`PumpChannel::last_decrypt_failed`] set, because the
//! controller reacts to them very differently from transport glitches.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use ypso_crypto::{CryptoError, PumpCryptor};
use ypso_proto::frame::{assemble, chunk, total_frames, FrameError};
use ypso_proto::gatt::{CHAR_AUTH_PASSWORD, CHAR_EXTENDED_READ, CHAR_SYSTEM_STATUS};
use ypso_proto::{append_crc, verify_crc};

use crate::auth::{auth_password, AUTH_SETTLE};
use crate::link::{LinkError, PumpLink};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("authentication write rejected")]
    AuthFailed,
    #[error("no session cryptor installed")]
    NoCryptor,
    #[error("response failed to decrypt")]
    DecryptFailed,
    #[error("counter sync read returned nothing")]
    SyncFailed,
    #[error(transparent)]
    Store(#[from] ypso_store::StoreError),
    #[error(transparent)]
    Parse(#[from] ypso_proto::ParseError),
    #[error(transparent)]
    Glb(#[from] ypso_proto::GlbCorrupt),
    #[error(transparent)]
    Command(#[from] ypso_proto::CommandError),
}

impl From<CryptoError> for ChannelError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptFailed => Self::DecryptFailed,
            CryptoError::KeyMissing => Self::NoCryptor,
            CryptoError::Store(e) => Self::Store(e),
        }
    }
}

/// Stateful protocol channel bound to one BLE link.
///
/// The link sits behind an `Arc` so callers can hold a disconnect
/// handle that outlives their borrow of the channel.
pub struct PumpChannel<L> {
    link: Arc<L>,
    cryptor: Option<PumpCryptor>,
    counters_synced: bool,
    last_decrypt_failed: bool,
}

impl<L: PumpLink> PumpChannel<L> {
    pub fn new(link: L) -> Self {
        Self {
            link: Arc::new(link),
            cryptor: None,
            counters_synced: false,
            last_decrypt_failed: false,
        }
    }

    pub fn link(&self) -> &L {
        self.link.as_ref()
    }

    /// Shared handle to the link, for disconnect-on-drop guards.
    pub fn link_handle(&self) -> Arc<L> {
        Arc::clone(&self.link)
    }

    /// Install a session cryptor. Counters are considered unsynced until
    /// the first successful decrypt imports the pump's reboot counter.
    pub fn install_cryptor(&mut self, cryptor: PumpCryptor) {
        self.cryptor = Some(cryptor);
        self.counters_synced = false;
        self.last_decrypt_failed = false;
    }

    pub fn take_cryptor(&mut self) -> Option<PumpCryptor> {
        self.counters_synced = false;
        self.cryptor.take()
    }

    pub fn mark_counters_unsynced(&mut self) {
        self.counters_synced = false;
    }

    /// Whether the most recent read pipeline failed at the decrypt step.
    pub fn last_decrypt_failed(&self) -> bool {
        self.last_decrypt_failed
    }

    pub async fn connect(&mut self) -> Result<(), ChannelError> {
        self.link.connect().await?;
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), ChannelError> {
        self.link.disconnect().await?;
        Ok(())
    }

    /// Write the MD5 password for `mac` and give the pump its settle time.
    pub async fn authenticate(&mut self, mac: &[u8; 6]) -> Result<(), ChannelError> {
        let password = auth_password(mac);
        self.link
            .write(CHAR_AUTH_PASSWORD, &password)
            .await
            .map_err(|err| {
                warn!(%err, "authentication write rejected");
                ChannelError::AuthFailed
            })?;
        tokio::time::sleep(AUTH_SETTLE).await;
        Ok(())
    }

    /// Encrypted write pipeline.
    pub async fn send_command(
        &mut self,
        characteristic: Uuid,
        payload: &[u8],
        add_crc: bool,
    ) -> Result<(), ChannelError> {
        let payload = if add_crc {
            append_crc(payload)
        } else {
            payload.to_vec()
        };

        self.ensure_counters_synced().await?;

        let cryptor = self.cryptor.as_mut().ok_or(ChannelError::NoCryptor)?;
        let envelope = cryptor.encrypt(&payload)?;
        let frames = chunk(&envelope)?;
        debug!(
            %characteristic,
            payload_len = payload.len(),
            frames = frames.len(),
            "sending encrypted command"
        );
        for frame in &frames {
            // No partial retry: the pump rejects replayed counter values,
            // so a failed frame terminates the whole command.
            self.link.write(characteristic, frame).await?;
        }
        Ok(())
    }

    /// Encrypted read pipeline. `None` means "no usable response": an
    /// empty first frame, a missing continuation frame, or a decrypt
    /// failure (check [`Self::last_decrypt_failed`]).
    pub async fn read_response(
        &mut self,
        characteristic: Uuid,
        has_crc: bool,
    ) -> Result<Option<Vec<u8>>, ChannelError> {
        self.last_decrypt_failed = false;

        let first = self.link.read(characteristic).await?;
        if first.len() <= 1 {
            debug!(%characteristic, "empty first frame");
            return Ok(None);
        }

        let total = total_frames(first[0]);
        let mut frames = Vec::with_capacity(total);
        frames.push(first);
        for n in 1..total {
            let tail = self.link.read(CHAR_EXTENDED_READ).await?;
            if tail.len() <= 1 {
                // Never assemble a partial buffer.
                warn!(%characteristic, frame = n + 1, total, "missing continuation frame");
                return Ok(None);
            }
            frames.push(tail);
        }

        let envelope = assemble(&frames);
        let cryptor = self.cryptor.as_mut().ok_or(ChannelError::NoCryptor)?;
        let plaintext = match cryptor.decrypt(&envelope) {
            Ok(plaintext) => plaintext,
            Err(CryptoError::DecryptFailed) => {
                warn!(%characteristic, "response failed to decrypt");
                self.last_decrypt_failed = true;
                return Ok(None);
            }
            Err(other) => return Err(other.into()),
        };
        // A successful decrypt imported the pump's reboot counter.
        self.counters_synced = true;

        if has_crc && verify_crc(&plaintext) {
            return Ok(Some(plaintext[..plaintext.len() - 2].to_vec()));
        }
        if has_crc {
            // CRC-agnostic callers may still parse the body.
            warn!(%characteristic, "response checksum mismatch");
        }
        Ok(Some(plaintext))
    }

    /// Before the first encrypted write of a freshly installed session,
    /// run a System Status read so the decrypt imports the pump's
    /// current reboot counter. A decrypt failure here propagates
    /// immediately; the key is dead and retrying cannot help.
    async fn ensure_counters_synced(&mut self) -> Result<(), ChannelError> {
        if self.counters_synced {
            return Ok(());
        }
        if self.cryptor.is_none() {
            return Err(ChannelError::NoCryptor);
        }
        debug!("counters unsynced, running status read first");
        match self.read_response(CHAR_SYSTEM_STATUS, true).await? {
            Some(_) => Ok(()),
            None if self.last_decrypt_failed => Err(ChannelError::DecryptFailed),
            None => Err(ChannelError::SyncFailed),
        }
    }
}
