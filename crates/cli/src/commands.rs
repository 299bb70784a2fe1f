use camino::Utf8PathBuf;
use clap::Args;
use std::path::Path;

use carchive::crypto::keyset::KeySet;
use carchive::dump::{dump as run_dump, CancelToken, DumpError, DumpOptions, FileSink};
use carchive::formats::nca::{FsSectionType, Nca};
use carchive::formats::pfs::SectionPartitionFs;
use carchive::formats::romfs::{IllegalCharReplacement, RomFsEntryKind, SectionRomFs};
use carchive::snafu::{ResultExt, Whatever};
use carchive::storage::FileRoStorage;

#[derive(Args, Debug)]
pub struct InfoOpts {
    /// Path to the content archive
    path: Utf8PathBuf,
}

#[derive(Args, Debug)]
pub struct ExtractOpts {
    /// Path to the content archive
    path: Utf8PathBuf,
    /// Section index to extract
    #[clap(long, default_value = "0")]
    section: usize,
    /// Output directory
    #[clap(long, default_value = "out")]
    output: Utf8PathBuf,
}

#[derive(Args, Debug)]
pub struct DumpOpts {
    /// Path to the content archive
    path: Utf8PathBuf,
    /// Output file
    output: Utf8PathBuf,
    /// Compute a CRC-32 of the output
    #[clap(long, default_value = "false")]
    crc: bool,
    /// Compute a SHA-256 of the output
    #[clap(long, default_value = "false")]
    sha256: bool,
}

fn open_nca(keys: Option<&Path>, path: &Utf8PathBuf) -> Result<Nca<FileRoStorage>, Whatever> {
    let key_set =
        KeySet::from_system(keys).whatever_context("Could not load the key material")?;
    let storage =
        FileRoStorage::open(path).whatever_context("Could not open the content file")?;
    Nca::new(&key_set, storage, None).whatever_context("Could not open the content archive")
}

pub fn info(keys: Option<&Path>, opts: InfoOpts) -> Result<(), Whatever> {
    let nca = open_nca(keys, &opts.path)?;

    println!("content type:   {:?}", nca.content_type());
    println!("format version: {:?}", nca.format_version());
    println!("content size:   {:#x}", nca.content_size());
    println!("program id:     {}", nca.header().program_id);
    println!("rights id:      {}", nca.header().rights_id);
    println!(
        "key generation: {}",
        nca.header().key_generation_value()
    );
    println!("main signature: {}", if nca.valid_main_signature() { "valid" } else { "INVALID" });

    for section in nca.sections() {
        println!(
            "section {}: {:?}, {:?}/{:?}, offset {:#x}, size {:#x}",
            section.index(),
            section.section_type(),
            section.hash_type(),
            section.encryption_type(),
            section.section_offset(),
            section.section_size(),
        );
    }

    Ok(())
}

pub fn extract(keys: Option<&Path>, opts: ExtractOpts) -> Result<(), Whatever> {
    let nca = open_nca(keys, &opts.path)?;

    let Some(section) = nca.section(opts.section) else {
        carchive::snafu::whatever!("Section {} is not populated", opts.section);
    };

    std::fs::create_dir_all(&opts.output).whatever_context("Could not create output dir")?;

    match section.section_type() {
        FsSectionType::PartitionFs => {
            let storage = nca
                .open_section_storage(opts.section)
                .whatever_context("Could not open the section storage")?;
            let fs = SectionPartitionFs::from_section(storage)
                .whatever_context("Could not parse the partition filesystem")?;

            for index in 0..fs.entry_count() {
                let Some(name) = fs.entry_name(index) else {
                    continue;
                };
                let entry = *fs.entry(index).unwrap();
                let data = fs
                    .read_entry_to_vec(&entry)
                    .whatever_context("Could not read an entry")?;
                let path = opts.output.join(name);
                std::fs::write(&path, data).whatever_context("Could not write a file")?;
                println!("{} ({:#x} bytes)", path, entry.size);
            }
        }
        FsSectionType::RomFs | FsSectionType::Nca0RomFs => {
            let storage = nca
                .open_section_storage(opts.section)
                .whatever_context("Could not open the section storage")?;
            let fs = SectionRomFs::from_section(storage)
                .whatever_context("Could not parse the filesystem")?;

            let items: Vec<_> = fs
                .walk()
                .collect::<Result<_, _>>()
                .whatever_context("Filesystem traversal failed")?;
            for (path, kind) in items {
                let rel = path.trim_start_matches('/');
                let out = opts.output.join(rel);
                match kind {
                    RomFsEntryKind::Directory => {
                        std::fs::create_dir_all(&out)
                            .whatever_context("Could not create a directory")?;
                    }
                    RomFsEntryKind::File { size } => {
                        let entry = fs
                            .open_file(&path)
                            .whatever_context("Could not reopen a walked file")?;
                        let safe = fs
                            .file_path(&entry, IllegalCharReplacement::ReplaceNonFs)
                            .whatever_context("Could not build a path")?;
                        let out = opts.output.join(safe.trim_start_matches('/'));
                        let data = fs
                            .read_file_to_vec(&entry)
                            .whatever_context("Could not read a file")?;
                        std::fs::write(&out, data).whatever_context("Could not write a file")?;
                        println!("{} ({:#x} bytes)", out, size);
                    }
                }
            }
        }
        FsSectionType::PatchRomFs => {
            carchive::snafu::whatever!(
                "Patch sections need their base archive attached; not supported here"
            );
        }
    }

    Ok(())
}

pub fn dump(keys: Option<&Path>, opts: DumpOpts) -> Result<(), Whatever> {
    let nca = open_nca(keys, &opts.path)?;

    let total_size = nca.content_size();
    let sink =
        FileSink::create(opts.output.as_std_path()).whatever_context("Could not create output")?;

    let options = DumpOptions {
        calculate_crc: opts.crc,
        calculate_sha256: opts.sha256,
        ..Default::default()
    };

    let report = run_dump(
        total_size,
        |offset, buf| {
            nca.read_content(offset, buf).map_err(|error| DumpError::Read {
                message: error.to_string(),
            })
        },
        sink,
        &mut [],
        &options,
        &CancelToken::new(),
    )
    .whatever_context("Dump failed")?;

    println!("wrote {:#x} bytes to {}", report.bytes_written, opts.output);
    if let Some(crc) = report.crc32 {
        println!("crc32:  {:08x}", crc);
    }
    if let Some(sha) = report.sha256 {
        println!("sha256: {}", hex::encode(sha));
    }

    Ok(())
}
