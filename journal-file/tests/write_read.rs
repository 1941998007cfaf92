//! Cross-file write/read scenarios.

use journal_common::{Id128, Microseconds};
use journal_file::{
    DirectoryReader, EntryRecord, JournalFileOptions, SeqnumSource, WritableJournal,
};
use tempfile::TempDir;
use uuid::Uuid;

const BOOT_ID: u128 = 0x11111111_1111_1111_1111_111111111111;

fn boot_id() -> Id128 {
    Id128(Uuid::from_u128(BOOT_ID).into_bytes())
}

fn options(seqnum_id: u128) -> JournalFileOptions {
    JournalFileOptions::new(
        Id128(Uuid::from_u128(0x22222222_2222_2222_2222_222222222222).into_bytes()),
        boot_id(),
        Id128(Uuid::from_u128(seqnum_id).into_bytes()),
    )
}

fn append_number(journal: &mut WritableJournal, usec: u64, number: u64) -> u64 {
    journal
        .append_entry(
            Microseconds(usec),
            Microseconds(usec),
            boot_id(),
            &[(b"NUMBER", number.to_string().as_bytes())],
        )
        .expect("append")
}

fn numbers(records: &[EntryRecord]) -> Vec<u64> {
    records
        .iter()
        .map(|record| {
            let value = record
                .items
                .iter()
                .find(|(name, _)| name == b"NUMBER")
                .map(|(_, value)| value.clone())
                .expect("NUMBER item");
            String::from_utf8(value).unwrap().parse().unwrap()
        })
        .collect()
}

fn drain_forward(reader: &mut DirectoryReader) -> Vec<EntryRecord> {
    let mut out = Vec::new();
    while let Some(record) = reader.next_entry().unwrap() {
        out.push(record);
    }
    out
}

#[test]
fn sequential_write_read() {
    let dir = TempDir::new().unwrap();

    let mut a = WritableJournal::create(dir.path().join("system.journal"), &options(0xa)).unwrap();
    let mut b =
        WritableJournal::create(dir.path().join("user-1000.journal"), &options(0xb)).unwrap();

    append_number(&mut a, 100, 1);
    append_number(&mut a, 200, 2);
    append_number(&mut b, 300, 3);
    append_number(&mut b, 400, 4);
    a.close().unwrap();
    b.close().unwrap();

    let mut reader = DirectoryReader::open(dir.path()).unwrap();

    let forward = drain_forward(&mut reader);
    assert_eq!(numbers(&forward), vec![1, 2, 3, 4]);

    reader.seek_tail();
    let mut backward = Vec::new();
    while let Some(record) = reader.previous_entry().unwrap() {
        backward.push(record);
    }
    assert_eq!(numbers(&backward), vec![4, 3, 2, 1]);

    reader.seek_tail();
    let landed = reader.previous_skip(4).unwrap().expect("lands on an entry");
    assert_eq!(numbers(&[landed]), vec![1]);
}

#[test]
fn interleaved_write_read() {
    let dir = TempDir::new().unwrap();

    let mut a = WritableJournal::create(dir.path().join("system.journal"), &options(0xa)).unwrap();
    let mut b =
        WritableJournal::create(dir.path().join("user-1000.journal"), &options(0xb)).unwrap();

    append_number(&mut a, 100, 1);
    append_number(&mut b, 200, 2);
    append_number(&mut a, 300, 3);
    append_number(&mut b, 400, 4);
    a.close().unwrap();
    b.close().unwrap();

    let mut reader = DirectoryReader::open(dir.path()).unwrap();
    let forward = drain_forward(&mut reader);
    assert_eq!(numbers(&forward), vec![1, 2, 3, 4]);
}

#[test]
fn seqnum_continuity_across_files() {
    let dir = TempDir::new().unwrap();
    let source = SeqnumSource::new(0);

    // A and B belong to the same owner: same seqnum id, shared counter.
    let mut a = WritableJournal::create(dir.path().join("system.journal"), &options(0xa)).unwrap();
    a.attach_seqnum_source(source.clone());
    assert_eq!(append_number(&mut a, 100, 1), 1);
    assert_eq!(append_number(&mut a, 200, 2), 2);

    let b_options = options(0xa).with_tail_entry_seqnum(a.tail_entry_seqnum());
    let b_path = dir.path().join("user-1000.journal");
    let mut b = WritableJournal::create(&b_path, &b_options).unwrap();
    b.attach_seqnum_source(source.clone());
    assert_eq!(append_number(&mut b, 300, 3), 3);
    assert_eq!(append_number(&mut b, 400, 4), 4);
    b.close().unwrap();

    // The shared counter saw B's appends, so A continues past them.
    assert_eq!(append_number(&mut a, 500, 5), 5);
    a.close().unwrap();

    // Reopening B independently continues from B's own tail: the next
    // seqnum collides with the one A issued. This is accepted, and the
    // reader resolves the duplicate by file mtime.
    let mut b_again = WritableJournal::open_writable(&b_path, &b_options).unwrap();
    assert_eq!(append_number(&mut b_again, 600, 6), 5);
    b_again.close().unwrap();

    let reader = DirectoryReader::open(dir.path()).unwrap();
    // Six entries written, one seqnum collides: five survive.
    assert_eq!(reader.n_entries(), 5);
}

#[test]
fn rotate_on_backward_time() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("system.journal");

    let mut journal = WritableJournal::create(&path, &options(0xa)).unwrap();
    let t = 1_000_000u64;
    append_number(&mut journal, t, 1);

    // The clock moved backwards: the file refuses the write, the caller
    // rotates and retries once.
    let result = journal.append_entry(
        Microseconds(t - 1_000_000),
        Microseconds(t),
        boot_id(),
        &[(b"NUMBER", b"2".as_slice())],
    );
    assert!(result.is_err());
    assert!(result.unwrap_err().is_transient());

    let mut successor = journal.rotate().unwrap();
    append_number(&mut successor, t - 1_000_000, 2);
    successor.close().unwrap();

    // Both files are readable; commit order wins over submitted realtime
    // because the files share a seqnum id.
    let mut reader = DirectoryReader::open(dir.path()).unwrap();
    let forward = drain_forward(&mut reader);
    assert_eq!(numbers(&forward), vec![1, 2]);

    let archived = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains('@'))
        .count();
    assert_eq!(archived, 1);
}
