//! Authoring-tool XML descriptors: plain string formatting over already
//! parsed structures, newline-terminated UTF-8. No I/O and no crypto.

use snafu::Snafu;
use std::fmt::Write;

use crate::formats::cnmt::{ContentMeta, ContentMetaAttribute, ContentMetaType, NcmContentType};
use crate::ids::ContentId;

#[derive(Snafu, Debug)]
pub enum XmlError {
    /// Content {content_id} is not referenced by the content meta
    UnreferencedContent { content_id: ContentId },
    /// The legal information blob is not valid UTF-8
    InvalidLegalInfo {},
}

/// Everything the descriptor needs to know about one referenced archive.
#[derive(Debug, Clone)]
pub struct AuthoringContent {
    pub content_type: NcmContentType,
    pub content_id: ContentId,
    pub size: u64,
    pub hash: [u8; 0x20],
    pub key_generation: u8,
    pub id_offset: u8,
}

fn hex_lower(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

fn attribute_names(attributes: ContentMetaAttribute) -> Vec<&'static str> {
    let mut names = Vec::new();
    if attributes.contains(ContentMetaAttribute::INCLUDES_EXFAT_DRIVER) {
        names.push("IncludesExFatDriver");
    }
    if attributes.contains(ContentMetaAttribute::REBOOTLESS) {
        names.push("Rebootless");
    }
    if attributes.contains(ContentMetaAttribute::COMPACTED) {
        names.push("Compacted");
    }
    names
}

/// Emits the content-meta descriptor: one `<Content>` per referenced
/// archive, required-version fields per meta type, and the stored digest.
///
/// Every entry in `contents` must either be referenced by the meta or be
/// the Meta archive itself.
pub fn content_meta_xml(
    meta: &ContentMeta,
    contents: &[AuthoringContent],
    meta_key_generation: u8,
) -> Result<String, XmlError> {
    let header = meta.header();
    let mut out = String::new();

    let version: u32 = header.version.into();
    writeln!(out, "<?xml version=\"1.0\" encoding=\"utf-8\"?>").unwrap();
    writeln!(out, "<ContentMeta>").unwrap();
    writeln!(out, "  <Type>{}</Type>", meta.meta_type().name()).unwrap();
    writeln!(out, "  <Id>0x{:016x}</Id>", meta.title_id()).unwrap();
    writeln!(out, "  <Version>{}</Version>", version).unwrap();
    writeln!(out, "  <ReleaseVersion>{}</ReleaseVersion>", version >> 16).unwrap();
    writeln!(out, "  <PrivateVersion>{}</PrivateVersion>", version & 0xffff).unwrap();

    let names = attribute_names(header.attributes);
    if names.is_empty() {
        writeln!(out, "  <ContentMetaAttribute />").unwrap();
    } else {
        for name in names {
            writeln!(
                out,
                "  <ContentMetaAttribute>{}</ContentMetaAttribute>",
                name
            )
            .unwrap();
        }
    }

    writeln!(
        out,
        "  <RequiredDownloadSystemVersion>{}</RequiredDownloadSystemVersion>",
        u32::from(header.required_download_system_version)
    )
    .unwrap();

    for content in contents {
        let referenced = content.content_type == NcmContentType::Meta
            || meta.find_content(&content.content_id).is_some();
        if !referenced {
            return Err(XmlError::UnreferencedContent {
                content_id: content.content_id,
            });
        }

        writeln!(out, "  <Content>").unwrap();
        writeln!(out, "    <Type>{}</Type>", content.content_type.name()).unwrap();
        writeln!(out, "    <Id>{}</Id>", content.content_id).unwrap();
        writeln!(out, "    <Size>{}</Size>", content.size).unwrap();
        writeln!(out, "    <Hash>{}</Hash>", hex_lower(&content.hash)).unwrap();
        writeln!(
            out,
            "    <KeyGeneration>{}</KeyGeneration>",
            content.key_generation
        )
        .unwrap();
        writeln!(out, "    <IdOffset>{}</IdOffset>", content.id_offset).unwrap();
        writeln!(out, "  </Content>").unwrap();
    }

    writeln!(out, "  <ContentMeta />").unwrap();
    writeln!(out, "  <Digest>{}</Digest>", hex_lower(meta.digest())).unwrap();
    writeln!(
        out,
        "  <KeyGenerationMin>{}</KeyGenerationMin>",
        meta_key_generation
    )
    .unwrap();
    writeln!(out, "  <KeepGeneration />").unwrap();
    writeln!(out, "  <KeepGenerationSpecified />").unwrap();

    let extended = meta.extended_header();
    match meta.meta_type() {
        ContentMetaType::Application => {
            if let crate::formats::cnmt::ExtendedHeader::Application {
                patch_id,
                required_system_version,
                required_application_version,
            } = extended
            {
                writeln!(
                    out,
                    "  <RequiredSystemVersion>{}</RequiredSystemVersion>",
                    u32::from(*required_system_version)
                )
                .unwrap();
                writeln!(out, "  <PatchId>0x{:016x}</PatchId>", patch_id).unwrap();
                writeln!(
                    out,
                    "  <RequiredApplicationVersion>{}</RequiredApplicationVersion>",
                    u32::from(*required_application_version)
                )
                .unwrap();
            }
        }
        ContentMetaType::Patch => {
            if let crate::formats::cnmt::ExtendedHeader::Patch {
                application_id,
                required_system_version,
                ..
            } = extended
            {
                writeln!(
                    out,
                    "  <RequiredSystemVersion>{}</RequiredSystemVersion>",
                    u32::from(*required_system_version)
                )
                .unwrap();
                writeln!(out, "  <ApplicationId>0x{:016x}</ApplicationId>", application_id)
                    .unwrap();
            }
        }
        ContentMetaType::AddOnContent => match extended {
            crate::formats::cnmt::ExtendedHeader::AddOnContent {
                application_id,
                required_application_version,
                data_patch_id,
                ..
            } => {
                writeln!(
                    out,
                    "  <RequiredApplicationVersion>{}</RequiredApplicationVersion>",
                    u32::from(*required_application_version)
                )
                .unwrap();
                writeln!(out, "  <ApplicationId>0x{:016x}</ApplicationId>", application_id)
                    .unwrap();
                writeln!(out, "  <DataPatchId>0x{:016x}</DataPatchId>", data_patch_id).unwrap();
            }
            crate::formats::cnmt::ExtendedHeader::AddOnContentLegacy {
                application_id,
                required_application_version,
            } => {
                writeln!(
                    out,
                    "  <RequiredApplicationVersion>{}</RequiredApplicationVersion>",
                    u32::from(*required_application_version)
                )
                .unwrap();
                writeln!(out, "  <ApplicationId>0x{:016x}</ApplicationId>", application_id)
                    .unwrap();
            }
            _ => {}
        },
        ContentMetaType::DataPatch => {
            if let crate::formats::cnmt::ExtendedHeader::DataPatch { data_id, .. } = extended {
                writeln!(out, "  <DataId>0x{:016x}</DataId>", data_id).unwrap();
            }
        }
        _ => {}
    }

    out.push_str("</ContentMeta>\n");
    Ok(out)
}

/// The legal-information blob is already XML; validate and pass it through
/// verbatim.
pub fn legal_info_xml(data: Vec<u8>) -> Result<String, XmlError> {
    String::from_utf8(data).map_err(|_| XmlError::InvalidLegalInfo {})
}

/// Small descriptor of a single content archive, for sidecar emission next
/// to a dumped file.
pub fn content_archive_xml(
    content_type: NcmContentType,
    content_id: &ContentId,
    size: u64,
    key_generation: u8,
    valid_signature: bool,
) -> String {
    let mut out = String::new();
    writeln!(out, "<?xml version=\"1.0\" encoding=\"utf-8\"?>").unwrap();
    writeln!(out, "<ContentArchive>").unwrap();
    writeln!(out, "  <Type>{}</Type>", content_type.name()).unwrap();
    writeln!(out, "  <Id>{}</Id>", content_id).unwrap();
    writeln!(out, "  <Size>{}</Size>", size).unwrap();
    writeln!(out, "  <KeyGeneration>{}</KeyGeneration>", key_generation).unwrap();
    writeln!(out, "  <ValidSignature>{}</ValidSignature>", valid_signature).unwrap();
    out.push_str("</ContentArchive>\n");
    out
}
