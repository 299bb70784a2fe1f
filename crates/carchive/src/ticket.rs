//! Ticket records and the process-wide titlekey store. Tickets come from
//! the console's ticket save images or from a ticket file on a cartridge;
//! personalized tickets additionally need the console's eticket RSA device
//! key to unwrap their titlekey block.

use binrw::{BinRead, BinWrite, NullString};
use bitflags::bitflags;
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::crypto::{rsa2048_oaep_decrypt_sha256, AesKey, RsaError, TitleKey};
use crate::hexstring::HexData;
use crate::ids::RightsId;

/// Tickets inside save images sit at this alignment.
const TICKET_ALIGNMENT: u64 = 0x400;
const TICKET_SIZE: usize = 0x2c0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[repr(u32)]
pub enum Signature {
    #[brw(magic = 0x10000u32)]
    Rsa4096Sha1(#[brw(pad_after = 0x3c)] HexData<0x200>),
    #[brw(magic = 0x10001u32)]
    Rsa2048Sha1(#[brw(pad_after = 0x3c)] HexData<0x100>),
    #[brw(magic = 0x10002u32)]
    EcdsaSha1(#[brw(pad_after = 0x40)] HexData<0x3c>),
    #[brw(magic = 0x10003u32)]
    Rsa4096Sha256(#[brw(pad_after = 0x3c)] HexData<0x200>),
    #[brw(magic = 0x10004u32)]
    Rsa2048Sha256(#[brw(pad_after = 0x3c)] HexData<0x100>),
    #[brw(magic = 0x10005u32)]
    EcdsaSha256(#[brw(pad_after = 0x40)] HexData<0x3c>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum TitleKeyType {
    Common = 0,
    Personalized = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum LicenseType {
    Permanent = 0,
    Demo = 1,
    Trial = 2,
    Rental = 3,
    Subscription = 4,
    Service = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct PropertyFlags(pub u32);
bitflags! {
    impl PropertyFlags: u32 {
        const PRE_INSTALL = 1 << 0;
        const SHARED_TITLE = 1 << 1;
        const ALLOW_ALL_CONTENT = 1 << 2;
    }
}

/// One ticket record: signature envelope, issuer, titlekey block and the
/// rights id it licenses.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct Ticket {
    pub signature: Signature,
    #[brw(pad_size_to = 0x40)]
    pub issuer: NullString,
    pub title_key_block: HexData<0x100>,
    pub format_version: u8,
    pub title_key_type: TitleKeyType,
    pub ticket_version: u16,
    pub license_type: LicenseType,
    pub master_key_revision: u8,
    pub property_flags: PropertyFlags,
    #[brw(pad_before = 0x6)]
    pub ticket_id: u64,
    pub device_id: u64,
    pub rights_id: RightsId,
    pub account_id: u32,
    pub sect_total_size: u32,
    pub sect_header_offset: u32,
    pub sect_num: u16,
    pub sect_entry_size: u16,
}

#[derive(Snafu, Debug)]
pub enum TicketError {
    /// No ticket found for rights id {rights_id}
    NoTicket { rights_id: RightsId },
    /// A personalized ticket exists but the eticket device key is unavailable
    PersonalizedTicketUnavailable {},
    /// Ticket parsing failed
    Parsing { source: binrw::Error },
    /// The eticket device key blob is malformed
    InvalidDeviceKey {},
    /// RSA-OAEP unwrap of the personalized titlekey failed
    Oaep { source: RsaError },
}

/// Console-specific RSA key used to unwrap personalized titlekeys. Derived
/// by decrypting a calibration-area blob with the eticket kek.
#[derive(Clone)]
pub struct EticketRsaDeviceKey {
    modulus: [u8; 0x100],
    private_exponent: [u8; 0x100],
    public_exponent: u32,
}

impl std::fmt::Debug for EticketRsaDeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EticketRsaDeviceKey").finish_non_exhaustive()
    }
}

impl EticketRsaDeviceKey {
    /// Decrypts the 0x240-byte calibration blob: a 16-byte counter followed
    /// by the CTR-encrypted private exponent, modulus and public exponent.
    pub fn from_calibration_blob(blob: &[u8], kek: AesKey) -> Result<Self, TicketError> {
        if blob.len() < 0x240 {
            return Err(TicketError::InvalidDeviceKey {});
        }

        let ctr: [u8; 0x10] = blob[..0x10].try_into().unwrap();
        let mut data = blob[0x10..0x240].to_vec();
        kek.crypt_ctr(&mut data, &ctr);

        let private_exponent: [u8; 0x100] = data[..0x100].try_into().unwrap();
        let modulus: [u8; 0x100] = data[0x100..0x200].try_into().unwrap();
        let public_exponent = u32::from_be_bytes(data[0x200..0x204].try_into().unwrap());

        if public_exponent != 0x10001 {
            return Err(TicketError::InvalidDeviceKey {});
        }

        Ok(Self {
            modulus,
            private_exponent,
            public_exponent,
        })
    }

    fn unwrap_title_key(&self, block: &[u8; 0x100]) -> Result<TitleKey, TicketError> {
        let plain = rsa2048_oaep_decrypt_sha256(
            &self.modulus,
            self.public_exponent,
            &self.private_exponent,
            None,
            block,
        )
        .context(OaepSnafu)?;

        if plain.len() != 0x10 {
            return Err(TicketError::InvalidDeviceKey {});
        }
        let mut key = [0u8; 0x10];
        key.copy_from_slice(&plain);
        Ok(TitleKey::from(key))
    }
}

impl Ticket {
    /// Extracts the (still titlekek-wrapped) titlekey. Common tickets carry
    /// it raw; personalized ones wrap it with the console's RSA key.
    pub fn title_key(
        &self,
        device_key: Option<&EticketRsaDeviceKey>,
    ) -> Result<TitleKey, TicketError> {
        match self.title_key_type {
            TitleKeyType::Common => {
                let mut key = [0u8; 0x10];
                key.copy_from_slice(&self.title_key_block.0[..0x10]);
                Ok(TitleKey::from(key))
            }
            TitleKeyType::Personalized => {
                let device_key =
                    device_key.ok_or(TicketError::PersonalizedTicketUnavailable {})?;
                device_key.unwrap_title_key(&self.title_key_block.0)
            }
        }
    }
}

/// Source of ticket files on an inserted cartridge, keyed by rights id.
pub trait CartridgeTicketSource: Send + Sync {
    fn ticket_data(&self, rights_id: &RightsId) -> Option<Vec<u8>>;
}

/// Process-wide titlekey store. Lookups scan the persisted common and
/// personalized ticket save images, then (optionally) the cartridge; results
/// are cached for the lifetime of the store behind a single mutex.
pub struct TicketStore {
    common_save: Option<Vec<u8>>,
    personalized_save: Option<Vec<u8>>,
    device_key: Option<EticketRsaDeviceKey>,
    cartridge: Option<Box<dyn CartridgeTicketSource>>,
    cache: Mutex<HashMap<RightsId, TitleKey>>,
}

impl std::fmt::Debug for TicketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketStore")
            .field("has_common_save", &self.common_save.is_some())
            .field("has_personalized_save", &self.personalized_save.is_some())
            .field("has_device_key", &self.device_key.is_some())
            .finish_non_exhaustive()
    }
}

impl TicketStore {
    pub fn new(
        common_save: Option<Vec<u8>>,
        personalized_save: Option<Vec<u8>>,
        device_key: Option<EticketRsaDeviceKey>,
    ) -> Self {
        Self {
            common_save,
            personalized_save,
            device_key,
            cartridge: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cartridge(mut self, source: Box<dyn CartridgeTicketSource>) -> Self {
        self.cartridge = Some(source);
        self
    }

    /// Imports a pre-resolved titlekey, e.g. one carried in a host titlekey
    /// file.
    pub fn import(&self, rights_id: RightsId, title_key: TitleKey) {
        self.cache.lock().unwrap().insert(rights_id, title_key);
    }

    /// Resolves a titlekey. Subsequent calls for the same rights id are
    /// served from the cache without touching the saves again.
    pub fn get(
        &self,
        rights_id: &RightsId,
        generation: u8,
        allow_cartridge_lookup: bool,
    ) -> Result<TitleKey, TicketError> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(key) = cache.get(rights_id) {
            return Ok(*key);
        }

        let ticket = self
            .find_in_save(self.common_save.as_deref(), rights_id)
            .or_else(|| self.find_in_save(self.personalized_save.as_deref(), rights_id))
            .or_else(|| {
                if !allow_cartridge_lookup {
                    return None;
                }
                let data = self.cartridge.as_ref()?.ticket_data(rights_id)?;
                parse_ticket_at(&data, rights_id)
            })
            .ok_or(TicketError::NoTicket {
                rights_id: *rights_id,
            })?;

        if ticket.master_key_revision != generation {
            debug!(
                ticket = ticket.master_key_revision,
                content = generation,
                "ticket and content disagree on the master key revision"
            );
        }

        let title_key = ticket.title_key(self.device_key.as_ref())?;
        cache.insert(*rights_id, title_key);
        Ok(title_key)
    }

    /// Stride-scans a save image for a well-formed ticket matching the
    /// rights id.
    fn find_in_save(&self, save: Option<&[u8]>, rights_id: &RightsId) -> Option<Ticket> {
        let save = save?;

        let mut offset = 0u64;
        while (offset as usize) + TICKET_SIZE <= save.len() {
            if let Some(ticket) = parse_ticket_at(&save[offset as usize..], rights_id) {
                return Some(ticket);
            }
            offset += TICKET_ALIGNMENT;
        }
        None
    }
}

/// Parses a ticket at the start of `data`, returning it only when valid and
/// matching the rights id.
fn parse_ticket_at(data: &[u8], rights_id: &RightsId) -> Option<Ticket> {
    if data.len() < TICKET_SIZE {
        return None;
    }

    let mut cursor = std::io::Cursor::new(data);
    let ticket = match Ticket::read(&mut cursor) {
        Ok(ticket) => ticket,
        Err(_) => return None,
    };

    // the issuer chain always starts at the root CA
    if !ticket.issuer.to_string().starts_with("Root-") {
        warn!("ticket with an unexpected issuer, skipping");
        return None;
    }

    (&ticket.rights_id == rights_id).then_some(ticket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::BinWrite;

    pub(crate) fn build_ticket(
        rights_id: RightsId,
        title_key_type: TitleKeyType,
        title_key_block: [u8; 0x100],
    ) -> Vec<u8> {
        let ticket = Ticket {
            signature: Signature::Rsa2048Sha256(HexData([0x5a; 0x100])),
            issuer: NullString::from("Root-CA00000003-XS00000020"),
            title_key_block: HexData(title_key_block),
            format_version: 2,
            title_key_type,
            ticket_version: 0,
            license_type: LicenseType::Permanent,
            master_key_revision: 0,
            property_flags: PropertyFlags::empty(),
            ticket_id: 0x1122334455667788,
            device_id: 0,
            rights_id,
            account_id: 0,
            sect_total_size: 0,
            sect_header_offset: 0x2c0,
            sect_num: 0,
            sect_entry_size: 0,
        };

        let mut cursor = std::io::Cursor::new(Vec::new());
        ticket.write(&mut cursor).unwrap();
        let mut data = cursor.into_inner();
        data.resize(TICKET_ALIGNMENT as usize, 0);
        data
    }

    fn rights_id() -> RightsId {
        "00112233445566778899aabbccddeeff".parse().unwrap()
    }

    #[test]
    fn common_ticket_resolution_and_caching() {
        let mut block = [0u8; 0x100];
        block[..0x10].copy_from_slice(&[0xaa; 0x10]);

        // save image with a leading non-ticket stride
        let mut save = vec![0u8; TICKET_ALIGNMENT as usize];
        save.extend_from_slice(&build_ticket(rights_id(), TitleKeyType::Common, block));

        let store = TicketStore::new(Some(save), None, None);

        let key = store.get(&rights_id(), 0, false).unwrap();
        assert_eq!(key, TitleKey::from([0xaa; 0x10]));

        // cached: dropping the save must not matter anymore
        let key2 = store.get(&rights_id(), 0, false).unwrap();
        assert_eq!(key, key2);
    }

    #[test]
    fn missing_ticket_is_reported() {
        let store = TicketStore::new(Some(vec![0u8; 0x1000]), None, None);
        assert!(matches!(
            store.get(&rights_id(), 0, false),
            Err(TicketError::NoTicket { .. })
        ));
    }

    #[test]
    fn personalized_without_device_key_fails() {
        let save = build_ticket(rights_id(), TitleKeyType::Personalized, [0x11; 0x100]);
        let store = TicketStore::new(None, Some(save), None);

        assert!(matches!(
            store.get(&rights_id(), 0, false),
            Err(TicketError::PersonalizedTicketUnavailable {})
        ));
    }

    #[test]
    fn cartridge_lookup_is_gated() {
        struct OneTicket(RightsId, Vec<u8>);
        impl CartridgeTicketSource for OneTicket {
            fn ticket_data(&self, rights_id: &RightsId) -> Option<Vec<u8>> {
                (rights_id == &self.0).then(|| self.1.clone())
            }
        }

        let mut block = [0u8; 0x100];
        block[..0x10].copy_from_slice(&[0xbb; 0x10]);
        let ticket = build_ticket(rights_id(), TitleKeyType::Common, block);

        let store = TicketStore::new(None, None, None)
            .with_cartridge(Box::new(OneTicket(rights_id(), ticket)));

        assert!(store.get(&rights_id(), 0, false).is_err());
        let key = store.get(&rights_id(), 0, true).unwrap();
        assert_eq!(key, TitleKey::from([0xbb; 0x10]));
    }
}
