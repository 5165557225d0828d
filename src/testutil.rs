//! Archive fixtures for tests.

use std::io::{Cursor, Seek, Write};

use image::{DynamicImage, ImageFormat, RgbImage};

/// One member of a fixture archive. `data: None` is a directory.
pub struct Member<'a> {
    pub name: &'a str,
    pub data: Option<&'a [u8]>,
    /// AES-encrypted with a password the reader never gets (zip only)
    pub encrypted: bool,
}

impl<'a> Member<'a> {
    pub fn file(name: &'a str, data: &'a [u8]) -> Self {
        Self {
            name,
            data: Some(data),
            encrypted: false,
        }
    }

    pub fn dir(name: &'a str) -> Self {
        Self {
            name,
            data: None,
            encrypted: false,
        }
    }

    pub fn encrypted(name: &'a str, data: &'a [u8]) -> Self {
        Self {
            name,
            data: Some(data),
            encrypted: true,
        }
    }
}

fn write_zip_members<W: Write + Seek>(zip: &mut zip::ZipWriter<W>, members: &[Member<'_>]) {
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for member in members {
        match member.data {
            Some(data) if member.encrypted => {
                let options = options.with_aes_encryption(zip::AesMode::Aes256, "fixture-secret");
                zip.start_file(member.name, options).unwrap();
                zip.write_all(data).unwrap();
            }
            Some(data) => {
                zip.start_file(member.name, options).unwrap();
                zip.write_all(data).unwrap();
            }
            None => {
                zip.add_directory(member.name, options).unwrap();
            }
        }
    }
}

pub fn zip_bytes(members: &[Member<'_>]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    write_zip_members(&mut zip, members);
    zip.finish().unwrap().into_inner()
}

/// Zip written to a non-seekable sink: every member has general purpose
/// flag bit 3 set and its sizes and CRC trail the data in a descriptor.
pub fn zip_stream_bytes(members: &[Member<'_>]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new_stream(Vec::new());
    write_zip_members(&mut zip, members);
    zip.finish().unwrap().into_inner()
}

pub fn tar_bytes(members: &[Member<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for member in members {
        let mut header = tar::Header::new_gnu();
        match member.data {
            Some(data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, member.name, data).unwrap();
            }
            None => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_cksum();
                builder
                    .append_data(&mut header, member.name, std::io::empty())
                    .unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

/// A small valid TIFF image.
pub fn tiff_bytes() -> Vec<u8> {
    let img = RgbImage::from_fn(4, 3, |x, y| image::Rgb([(x * 60) as u8, (y * 80) as u8, 128]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Tiff)
        .unwrap();
    out.into_inner()
}
