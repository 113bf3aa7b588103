//! Flat ISO 9660 image builder with Rock Ridge names.
//!
//! Cloud-init's NoCloud datasource wants a small ISO labelled `CIDATA` whose
//! root directory holds `user-data`, `meta-data`, and `network-config`.
//! Plain ISO 9660 cannot carry those lowercase hyphenated names, so each
//! directory record gets a Rock Ridge NM (alternate name) entry; the kernel
//! spots Rock Ridge via the SP entry on the `.` record.
//!
//! Only what a seed image needs is supported: files in the root directory,
//! no subdirectories, no Joliet, no boot catalog.

const SECTOR: usize = 2048;

/// Sector layout: system area, PVD, terminator, both path tables, root
/// directory, then file data.
const PVD_SECTOR: usize = 16;
const LPATH_SECTOR: usize = 18;
const MPATH_SECTOR: usize = 19;
const ROOT_SECTOR: usize = 20;
const FIRST_FILE_SECTOR: usize = 21;

/// A file to place in the image's root directory.
pub struct IsoFile<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

/// Build a complete ISO image.
///
/// # Panics
///
/// Panics if `volume_id` is not ASCII or exceeds 32 characters, or if the
/// directory records for `files` overflow one sector — both are programmer
/// errors for seed-sized images.
pub fn build_iso(volume_id: &str, files: &[IsoFile<'_>]) -> Vec<u8> {
    assert!(
        volume_id.is_ascii() && volume_id.len() <= 32,
        "volume id must be ASCII, max 32 chars"
    );

    let mut extents = Vec::with_capacity(files.len());
    let mut next = FIRST_FILE_SECTOR;
    for f in files {
        extents.push(next as u32);
        next += f.data.len().div_ceil(SECTOR).max(1);
    }
    let total_sectors = next;

    let mut iso = vec![0u8; total_sectors * SECTOR];

    write_pvd(&mut iso, volume_id, total_sectors as u32);
    write_terminator(&mut iso);
    write_path_tables(&mut iso);
    write_root_dir(&mut iso, files, &extents);

    for (f, &extent) in files.iter().zip(&extents) {
        let at = extent as usize * SECTOR;
        iso[at..at + f.data.len()].copy_from_slice(f.data);
    }

    iso
}

/// Write `val` as the ISO's both-endian u32 (LE then BE, 8 bytes).
fn both_u32(buf: &mut [u8], at: usize, val: u32) {
    buf[at..at + 4].copy_from_slice(&val.to_le_bytes());
    buf[at + 4..at + 8].copy_from_slice(&val.to_be_bytes());
}

fn both_u16(buf: &mut [u8], at: usize, val: u16) {
    buf[at..at + 2].copy_from_slice(&val.to_le_bytes());
    buf[at + 2..at + 4].copy_from_slice(&val.to_be_bytes());
}

fn write_pvd(iso: &mut [u8], volume_id: &str, total_sectors: u32) {
    let pvd = &mut iso[PVD_SECTOR * SECTOR..(PVD_SECTOR + 1) * SECTOR];
    pvd[0] = 1; // type: primary
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1; // version

    pvd[8..72].fill(b' '); // system id + volume id, space padded
    pvd[40..40 + volume_id.len()].copy_from_slice(volume_id.as_bytes());

    both_u32(pvd, 80, total_sectors);
    both_u16(pvd, 120, 1); // volume set size
    both_u16(pvd, 124, 1); // volume sequence number
    both_u16(pvd, 128, SECTOR as u16);
    both_u32(pvd, 132, 10); // path table size: single root entry
    pvd[140..144].copy_from_slice(&(LPATH_SECTOR as u32).to_le_bytes());
    pvd[148..152].copy_from_slice(&(MPATH_SECTOR as u32).to_be_bytes());

    // Root directory record, embedded at offset 156. Identifier is the
    // single byte 0x00 ("this directory").
    let rec = dir_record(ROOT_SECTOR as u32, SECTOR as u32, &[0x00], true, &[]);
    pvd[156..156 + rec.len()].copy_from_slice(&rec);

    pvd[190..814].fill(b' '); // publisher/preparer/application ids
    pvd[881] = 1; // file structure version
}

fn write_terminator(iso: &mut [u8]) {
    let t = &mut iso[17 * SECTOR..18 * SECTOR];
    t[0] = 255;
    t[1..6].copy_from_slice(b"CD001");
    t[6] = 1;
}

/// One root entry per table, little- and big-endian variants.
fn write_path_tables(iso: &mut [u8]) {
    for (sector, big) in [(LPATH_SECTOR, false), (MPATH_SECTOR, true)] {
        let t = &mut iso[sector * SECTOR..];
        t[0] = 1; // identifier length
        let extent = ROOT_SECTOR as u32;
        let parent = 1u16;
        if big {
            t[2..6].copy_from_slice(&extent.to_be_bytes());
            t[6..8].copy_from_slice(&parent.to_be_bytes());
        } else {
            t[2..6].copy_from_slice(&extent.to_le_bytes());
            t[6..8].copy_from_slice(&parent.to_le_bytes());
        }
        // t[8] = 0x00 root identifier, t[9] padding — already zero.
    }
}

fn write_root_dir(iso: &mut [u8], files: &[IsoFile<'_>], extents: &[u32]) {
    let mut at = ROOT_SECTOR * SECTOR;
    let end = at + SECTOR;

    // "." carries the SP entry announcing SUSP/Rock Ridge use.
    let sp = [b'S', b'P', 7, 1, 0xBE, 0xEF, 0];
    for (id, susp) in [(&[0x00u8][..], &sp[..]), (&[0x01u8][..], &[][..])] {
        let rec = dir_record(ROOT_SECTOR as u32, SECTOR as u32, id, true, susp);
        iso[at..at + rec.len()].copy_from_slice(&rec);
        at += rec.len();
    }

    let mut used_ids: Vec<String> = Vec::new();
    for (f, &extent) in files.iter().zip(extents) {
        let id = iso_identifier(f.name, &mut used_ids);
        let susp = rock_ridge_entries(f.name);
        let rec = dir_record(extent, f.data.len() as u32, id.as_bytes(), false, &susp);
        // Records must not cross a sector boundary; seed images fit in one.
        assert!(at + rec.len() <= end, "root directory overflows one sector");
        iso[at..at + rec.len()].copy_from_slice(&rec);
        at += rec.len();
    }
}

/// Serialize one directory record with an optional system-use suffix.
fn dir_record(extent: u32, size: u32, identifier: &[u8], dir: bool, susp: &[u8]) -> Vec<u8> {
    let id_pad = identifier.len() % 2 == 0; // pad byte keeps the record even
    let len = 33 + identifier.len() + usize::from(id_pad) + susp.len();
    let mut rec = vec![0u8; len];
    rec[0] = len as u8;
    both_u32(&mut rec, 2, extent);
    both_u32(&mut rec, 10, size);
    // bytes 18..25: recording date — zeros are accepted everywhere
    rec[25] = if dir { 0x02 } else { 0x00 };
    both_u16(&mut rec, 28, 1); // volume sequence number
    rec[32] = identifier.len() as u8;
    rec[33..33 + identifier.len()].copy_from_slice(identifier);
    let susp_at = len - susp.len();
    rec[susp_at..].copy_from_slice(susp);
    rec
}

/// NM (alternate name) + PX (POSIX attributes) entries for a file record.
fn rock_ridge_entries(name: &str) -> Vec<u8> {
    let mut susp = Vec::with_capacity(5 + name.len() + 36);
    susp.extend_from_slice(&[b'N', b'M', (5 + name.len()) as u8, 1, 0]);
    susp.extend_from_slice(name.as_bytes());

    susp.extend_from_slice(&[b'P', b'X', 36, 1]);
    let mut px = [0u8; 32];
    both_u32(&mut px, 0, 0o100444); // mode: regular file, world readable
    both_u32(&mut px, 8, 1); // nlink
    // uid/gid stay 0
    susp.extend_from_slice(&px);
    susp
}

/// Map a POSIX name to a unique ISO level 1 identifier (`ABCDEFGH.;1`).
/// The real name travels in the NM entry; this one only has to be legal
/// and unique.
fn iso_identifier(name: &str, used: &mut Vec<String>) -> String {
    let mut base: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .take(8)
        .collect();
    if base.is_empty() {
        base.push('F');
    }
    let mut candidate = base.clone();
    let mut n = 0u32;
    while used.contains(&candidate) {
        n += 1;
        let suffix = n.to_string();
        let keep = base.len().min(8 - suffix.len());
        candidate = format!("{}{suffix}", &base[..keep]);
    }
    used.push(candidate.clone());
    format!("{candidate}.;1")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Vec<u8> {
        build_iso(
            "CIDATA",
            &[
                IsoFile {
                    name: "meta-data",
                    data: b"instance-id: iid-myvm\n",
                },
                IsoFile {
                    name: "user-data",
                    data: b"#cloud-config\n",
                },
            ],
        )
    }

    #[test]
    fn pvd_magic_and_label() {
        let iso = seed();
        assert_eq!(&iso[16 * SECTOR + 1..16 * SECTOR + 6], b"CD001");
        assert_eq!(&iso[16 * SECTOR + 40..16 * SECTOR + 46], b"CIDATA");
        assert_eq!(iso[17 * SECTOR], 255, "terminator follows the PVD");
    }

    #[test]
    fn sector_aligned_file_data() {
        let iso = seed();
        assert_eq!(iso.len() % SECTOR, 0);
        assert!(iso[FIRST_FILE_SECTOR * SECTOR..].starts_with(b"instance-id"));
        assert!(iso[(FIRST_FILE_SECTOR + 1) * SECTOR..].starts_with(b"#cloud-config"));
    }

    #[test]
    fn rock_ridge_names_present() {
        let iso = seed();
        let root = &iso[ROOT_SECTOR * SECTOR..(ROOT_SECTOR + 1) * SECTOR];
        let has = |needle: &[u8]| root.windows(needle.len()).any(|w| w == needle);
        assert!(has(b"meta-data"));
        assert!(has(b"user-data"));
        assert!(has(b"SP"), "SUSP indicator missing from '.' record");
    }

    #[test]
    fn identifiers_stay_unique() {
        let mut used = Vec::new();
        let a = iso_identifier("user-data", &mut used);
        let b = iso_identifier("user.data", &mut used);
        assert_ne!(a, b);
        assert!(a.ends_with(".;1"));
    }

    #[test]
    fn empty_file_still_gets_an_extent() {
        let iso = build_iso("CIDATA", &[IsoFile { name: "empty", data: b"" }]);
        assert_eq!(iso.len(), (FIRST_FILE_SECTOR + 1) * SECTOR);
    }
}
