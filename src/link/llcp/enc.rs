//! Encryption start and pause state machine.
//!
//! Both peers contribute half of the session key diversifier (`SKDm`/`SKDs`) and the packet
//! nonce IV (`IVm`/`IVs`). The session key is derived by encrypting the concatenated diversifier
//! with the connection's long-term key, which the host provides in response to a
//! [`LongTermKeyRequest`] event.
//!
//! The machine tracks *where in the handshake* the connection is. It does not touch the radio:
//! every transition tells the caller which PDUs to send and when to switch the link crypto on or
//! off, and the caller forwards that to the platform through the next [`Cmd`].
//!
//! Encryption is switched on asymmetrically during the start procedure. The slave starts
//! decrypting received traffic when it sends `LL_START_ENC_REQ`, but transmits unencrypted until
//! it has seen the master's `LL_START_ENC_RSP`. The transitions below encode that ordering.
//!
//! [`LongTermKeyRequest`]: ../../../host/enum.Event.html
//! [`Cmd`]: ../../struct.Cmd.html

use crate::{config::Cipher, host::Role, Error};

/// Handshake position of the encryption machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EncState {
    /// No encryption, no handshake in progress.
    Unencrypted,

    /// Master sent `LL_ENC_REQ` and waits for the slave's `LL_ENC_RSP`.
    EncRspWait,

    /// Slave answered `LL_ENC_REQ` and waits for the host to supply the long-term key.
    LtkRequestWait,

    /// Master has the session key and waits for the slave's `LL_START_ENC_REQ`.
    StartEncReqWait,

    /// Waiting for the peer's `LL_START_ENC_RSP`.
    ///
    /// On the master, both directions are already encrypted. On the slave, only the receive
    /// direction is.
    StartEncRspWait,

    /// Both directions encrypted, handshake complete.
    Encrypted,

    /// `LL_PAUSE_ENC_REQ` exchanged, waiting for the (final) `LL_PAUSE_ENC_RSP`.
    PauseEncRspWait,

    /// Encryption paused. A new encryption start reuses this machine from the top.
    Paused,
}

/// Link crypto change the platform must apply before the next connection event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CryptoChange {
    /// Start decrypting received PDUs. Transmissions stay in the clear.
    EnableRx,

    /// Start encrypting transmitted PDUs (reception is already encrypted).
    EnableTx,

    /// Encrypt and decrypt in both directions.
    EnableBoth,

    /// Stop encrypting entirely.
    Disable,
}

/// What the connection must do after feeding a `LL_START_ENC_RSP` into the machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StartEncOutcome {
    /// Slave side: answer with our own `LL_START_ENC_RSP` (ahead of queued data) and enable
    /// transmit encryption. The link is now fully encrypted.
    RespondAndFinish,

    /// Master side: nothing to send, the handshake is complete.
    Finish,
}

/// Per-connection encryption state.
pub struct EncryptionState {
    state: EncState,
    skd_m: u64,
    iv_m: u32,
    skd_s: u64,
    iv_s: u32,
    session_key: [u8; 16],
    pause_initiator: bool,
}

impl EncryptionState {
    pub fn new() -> Self {
        Self {
            state: EncState::Unencrypted,
            skd_m: 0,
            iv_m: 0,
            skd_s: 0,
            iv_s: 0,
            session_key: [0; 16],
            pause_initiator: false,
        }
    }

    pub fn state(&self) -> EncState {
        self.state
    }

    /// Returns whether payloads are encrypted in both directions.
    pub fn is_encrypted(&self) -> bool {
        self.state == EncState::Encrypted
    }

    /// Returns whether an encryption start or pause handshake is in flight.
    pub fn in_transition(&self) -> bool {
        !matches!(
            self.state,
            EncState::Unencrypted | EncState::Encrypted | EncState::Paused
        )
    }

    /// Returns the derived session key. Only meaningful once the long-term key was supplied.
    pub fn session_key(&self) -> &[u8; 16] {
        &self.session_key
    }

    /// Returns the 8-byte packet nonce IV (`IVm || IVs`).
    pub fn iv(&self) -> [u8; 8] {
        let mut iv = [0; 8];
        iv[..4].copy_from_slice(&self.iv_m.to_le_bytes());
        iv[4..].copy_from_slice(&self.iv_s.to_le_bytes());
        iv
    }

    fn derive_session_key<C: Cipher>(&mut self, cipher: &mut C, ltk: &[u8; 16]) {
        let mut block = [0; 16];
        block[..8].copy_from_slice(&self.skd_m.to_le_bytes());
        block[8..].copy_from_slice(&self.skd_s.to_le_bytes());
        cipher.encrypt_block(ltk, &mut block);
        self.session_key = block;
    }

    /// Master: starts the encryption procedure with freshly generated `SKDm`/`IVm`.
    ///
    /// The caller sends `LL_ENC_REQ` carrying these values (plus the host-supplied `Rand` and
    /// `EDIV`) and pauses data traffic until the handshake concludes.
    pub fn initiate(&mut self, skd_m: u64, iv_m: u32) -> Result<(), Error> {
        match self.state {
            EncState::Unencrypted | EncState::Paused => {
                self.skd_m = skd_m;
                self.iv_m = iv_m;
                self.state = EncState::EncRspWait;
                Ok(())
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Slave: handles a received `LL_ENC_REQ`, contributing freshly generated `SKDs`/`IVs`.
    ///
    /// The caller must answer with `LL_ENC_RSP` carrying `skd_s`/`iv_s` and emit a
    /// `LongTermKeyRequest` event to the host.
    pub fn on_enc_req(
        &mut self,
        skd_m: u64,
        iv_m: u32,
        skd_s: u64,
        iv_s: u32,
    ) -> Result<(), Error> {
        match self.state {
            EncState::Unencrypted | EncState::Paused => {
                self.skd_m = skd_m;
                self.iv_m = iv_m;
                self.skd_s = skd_s;
                self.iv_s = iv_s;
                self.state = EncState::LtkRequestWait;
                Ok(())
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Master: handles the slave's `LL_ENC_RSP` and derives the session key.
    pub fn on_enc_rsp<C: Cipher>(
        &mut self,
        skd_s: u64,
        iv_s: u32,
        cipher: &mut C,
        ltk: &[u8; 16],
    ) -> Result<(), Error> {
        match self.state {
            EncState::EncRspWait => {
                self.skd_s = skd_s;
                self.iv_s = iv_s;
                self.derive_session_key(cipher, ltk);
                self.state = EncState::StartEncReqWait;
                Ok(())
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Slave: the host supplied the long-term key.
    ///
    /// Derives the session key. The caller sends `LL_START_ENC_REQ` (ahead of queued data) and
    /// applies the returned crypto change: from this point on, received traffic is encrypted.
    pub fn ltk_provided<C: Cipher>(
        &mut self,
        cipher: &mut C,
        ltk: &[u8; 16],
    ) -> Result<CryptoChange, Error> {
        match self.state {
            EncState::LtkRequestWait => {
                self.derive_session_key(cipher, ltk);
                self.state = EncState::StartEncRspWait;
                Ok(CryptoChange::EnableRx)
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Slave: the host has no key for this `Rand`/`EDIV`.
    ///
    /// The caller rejects the procedure with `LL_REJECT_IND_EXT` and error `PinOrKeyMissing`.
    pub fn ltk_denied(&mut self) -> Result<(), Error> {
        match self.state {
            EncState::LtkRequestWait => {
                self.state = EncState::Unencrypted;
                Ok(())
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Master: handles the slave's `LL_START_ENC_REQ`.
    ///
    /// The caller applies the returned crypto change and answers with `LL_START_ENC_RSP`, which
    /// is already sent encrypted.
    pub fn on_start_enc_req(&mut self) -> Result<CryptoChange, Error> {
        match self.state {
            EncState::StartEncReqWait => {
                self.state = EncState::StartEncRspWait;
                Ok(CryptoChange::EnableBoth)
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Handles the peer's `LL_START_ENC_RSP`, completing the handshake.
    ///
    /// The caller emits exactly one `EncryptionChange` event to the host, then acts on the
    /// returned outcome.
    pub fn on_start_enc_rsp(&mut self, role: Role) -> Result<StartEncOutcome, Error> {
        match self.state {
            EncState::StartEncRspWait => {
                self.state = EncState::Encrypted;
                Ok(match role {
                    Role::Slave => StartEncOutcome::RespondAndFinish,
                    Role::Master => StartEncOutcome::Finish,
                })
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Starts the encryption pause procedure.
    ///
    /// The caller sends `LL_PAUSE_ENC_REQ` (still encrypted).
    pub fn initiate_pause(&mut self) -> Result<(), Error> {
        match self.state {
            EncState::Encrypted => {
                self.pause_initiator = true;
                self.state = EncState::PauseEncRspWait;
                Ok(())
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Handles a received `LL_PAUSE_ENC_REQ`.
    ///
    /// The caller answers with `LL_PAUSE_ENC_RSP` (ahead of queued data, still encrypted) and
    /// then applies the returned crypto change. The final, unencrypted `LL_PAUSE_ENC_RSP` from
    /// the initiator concludes the procedure.
    pub fn on_pause_enc_req(&mut self) -> Result<CryptoChange, Error> {
        match self.state {
            EncState::Encrypted => {
                self.pause_initiator = false;
                self.state = EncState::PauseEncRspWait;
                Ok(CryptoChange::Disable)
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Handles a received `LL_PAUSE_ENC_RSP`.
    ///
    /// On the initiator, the caller must answer with its own (now unencrypted)
    /// `LL_PAUSE_ENC_RSP` and apply the returned crypto change. On the responder this is the
    /// final PDU of the procedure and there is nothing left to do.
    pub fn on_pause_enc_rsp(&mut self) -> Result<Option<CryptoChange>, Error> {
        match self.state {
            EncState::PauseEncRspWait => {
                self.state = EncState::Paused;
                Ok(if self.pause_initiator {
                    Some(CryptoChange::Disable)
                } else {
                    None
                })
            }
            _ => Err(Error::InvalidValue),
        }
    }
}

impl Default for EncryptionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// AES stand-in that XORs key and block, enough to check key assembly.
    struct XorCipher;

    impl Cipher for XorCipher {
        fn encrypt_block(&mut self, key: &[u8; 16], block: &mut [u8; 16]) {
            for (b, k) in block.iter_mut().zip(key) {
                *b ^= k;
            }
        }
    }

    const LTK: [u8; 16] = [0x42; 16];

    #[test]
    fn slave_start_sequence() {
        let mut enc = EncryptionState::new();
        let mut encrypted_transitions = 0;

        enc.on_enc_req(0x1111_2222_3333_4444, 0xaaaa_bbbb, 0x5555_6666_7777_8888, 0xcccc_dddd)
            .unwrap();
        assert_eq!(enc.state(), EncState::LtkRequestWait);

        assert_eq!(
            enc.ltk_provided(&mut XorCipher, &LTK).unwrap(),
            CryptoChange::EnableRx
        );
        assert_eq!(enc.state(), EncState::StartEncRspWait);

        assert_eq!(
            enc.on_start_enc_rsp(Role::Slave).unwrap(),
            StartEncOutcome::RespondAndFinish
        );
        if enc.is_encrypted() {
            encrypted_transitions += 1;
        }

        // A stray repeat of the response must not produce a second completion.
        assert_eq!(enc.on_start_enc_rsp(Role::Slave).unwrap_err(), Error::InvalidValue);
        assert_eq!(encrypted_transitions, 1);

        // SK = LTK ^ (SKDm || SKDs), with both halves little-endian.
        let mut expected = [0u8; 16];
        expected[..8].copy_from_slice(&0x1111_2222_3333_4444u64.to_le_bytes());
        expected[8..].copy_from_slice(&0x5555_6666_7777_8888u64.to_le_bytes());
        for b in &mut expected {
            *b ^= 0x42;
        }
        assert_eq!(enc.session_key(), &expected);

        let mut iv = [0u8; 8];
        iv[..4].copy_from_slice(&0xaaaa_bbbbu32.to_le_bytes());
        iv[4..].copy_from_slice(&0xcccc_ddddu32.to_le_bytes());
        assert_eq!(enc.iv(), iv);
    }

    #[test]
    fn master_start_sequence() {
        let mut enc = EncryptionState::new();

        enc.initiate(1, 2).unwrap();
        assert_eq!(enc.state(), EncState::EncRspWait);

        enc.on_enc_rsp(3, 4, &mut XorCipher, &LTK).unwrap();
        assert_eq!(enc.state(), EncState::StartEncReqWait);

        assert_eq!(enc.on_start_enc_req().unwrap(), CryptoChange::EnableBoth);
        assert_eq!(
            enc.on_start_enc_rsp(Role::Master).unwrap(),
            StartEncOutcome::Finish
        );
        assert!(enc.is_encrypted());
    }

    #[test]
    fn ltk_denial_returns_to_unencrypted() {
        let mut enc = EncryptionState::new();
        enc.on_enc_req(1, 2, 3, 4).unwrap();
        enc.ltk_denied().unwrap();
        assert_eq!(enc.state(), EncState::Unencrypted);
        assert!(!enc.in_transition());
    }

    #[test]
    fn pause_and_restart() {
        let mut enc = EncryptionState::new();
        enc.initiate(1, 2).unwrap();
        enc.on_enc_rsp(3, 4, &mut XorCipher, &LTK).unwrap();
        enc.on_start_enc_req().unwrap();
        enc.on_start_enc_rsp(Role::Master).unwrap();

        enc.initiate_pause().unwrap();
        assert_eq!(enc.state(), EncState::PauseEncRspWait);
        assert_eq!(
            enc.on_pause_enc_rsp().unwrap(),
            Some(CryptoChange::Disable)
        );
        assert_eq!(enc.state(), EncState::Paused);

        // Re-encryption starts over from the paused state.
        enc.initiate(9, 9).unwrap();
        assert_eq!(enc.state(), EncState::EncRspWait);
    }

    #[test]
    fn pause_responder_waits_for_final_rsp() {
        let mut enc = EncryptionState::new();
        enc.on_enc_req(1, 2, 3, 4).unwrap();
        enc.ltk_provided(&mut XorCipher, &LTK).unwrap();
        enc.on_start_enc_rsp(Role::Slave).unwrap();

        assert_eq!(enc.on_pause_enc_req().unwrap(), CryptoChange::Disable);
        assert_eq!(enc.on_pause_enc_rsp().unwrap(), None);
        assert_eq!(enc.state(), EncState::Paused);
    }

    #[test]
    fn out_of_order_pdus_are_protocol_violations() {
        let mut enc = EncryptionState::new();
        assert_eq!(enc.on_start_enc_req().unwrap_err(), Error::InvalidValue);
        assert_eq!(
            enc.on_start_enc_rsp(Role::Master).unwrap_err(),
            Error::InvalidValue
        );
        assert_eq!(enc.on_pause_enc_req().unwrap_err(), Error::InvalidValue);
    }
}
