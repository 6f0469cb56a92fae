//! End-to-end wire-protocol tests: a simulated host drives the engine over
//! the simulated cable, transaction by transaction.

use pmd32_core::geometry::{
    FORMAT_FILL, IMAGE_SIZE, PHYS_SECTOR_SIZE, SECTOR_SIZE, TRACK_SIZE,
};
use pmd32_core::protocol::{ACK, IDLE, NAK};
use pmd32_core::{
    AutoMountStore, DiskStorage, HostClient, HostError, ListEntry, MemoryStorage, Pmd32Engine,
    SimBus, Status,
};

fn setup() -> (Pmd32Engine<SimBus, MemoryStorage>, HostClient) {
    let (bus, host) = SimBus::pair();
    let storage = MemoryStorage::new();
    storage.add_image("/DISK.P32");
    let engine = Pmd32Engine::new(bus, storage);
    (engine, HostClient::new(host))
}

fn setup_mounted() -> (Pmd32Engine<SimBus, MemoryStorage>, HostClient) {
    let (mut engine, client) = setup();
    engine.mount_drive(0, "/DISK.P32", false).unwrap();
    (engine, client)
}

#[test]
fn test_logical_read_scenario() {
    // image whose first 128 bytes are 0xAA: opcode 0x51, selector 0x00,
    // track 0x00, checksum 0x51 must yield OK, the payload, checksum 0x00
    let (bus, host) = SimBus::pair();
    let storage = MemoryStorage::new();
    let mut image = vec![FORMAT_FILL; IMAGE_SIZE as usize];
    image[..SECTOR_SIZE].fill(0xAA);
    storage.add_file("/DISK.P32", image);
    let mut engine = Pmd32Engine::new(bus, storage);
    engine.mount_drive(0, "/DISK.P32", false).unwrap();

    host.queue(&[IDLE, 0x51, 0x00, 0x00, 0x51]);
    assert!(engine.poll());

    let sent = host.take_sent();
    assert_eq!(sent[0], IDLE);
    assert_eq!(sent[1], ACK);
    assert_eq!(sent[2], Status::Ok.as_byte());
    assert_eq!(&sent[3..3 + SECTOR_SIZE], vec![0xAA; SECTOR_SIZE].as_slice());
    assert_eq!(sent[3 + SECTOR_SIZE], 0x00);
    assert_eq!(sent.len(), 4 + SECTOR_SIZE);
}

#[test]
fn test_write_then_read_round_trip() {
    let (mut engine, mut client) = setup_mounted();

    let mut payload = [0u8; SECTOR_SIZE];
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte = index as u8;
    }
    client
        .write_sector(&mut engine, 0, 7, 11, &payload)
        .unwrap();

    let back = client.read_sector(&mut engine, 0, 7, 11).unwrap();
    assert_eq!(back, payload);

    // neighbors untouched
    let other = client.read_sector(&mut engine, 0, 7, 12).unwrap();
    assert_eq!(other, vec![FORMAT_FILL; SECTOR_SIZE]);
}

#[test]
fn test_physical_write_spans_four_logical_sectors() {
    let (mut engine, mut client) = setup_mounted();

    let mut payload = [0u8; PHYS_SECTOR_SIZE];
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte = (index % 251) as u8;
    }
    client
        .write_physical(&mut engine, 0, 1, 4, &payload)
        .unwrap();

    for quarter in 0..4u8 {
        let sector = client
            .read_sector(&mut engine, 0, 1, 4 + quarter)
            .unwrap();
        let offset = quarter as usize * SECTOR_SIZE;
        assert_eq!(sector, &payload[offset..offset + SECTOR_SIZE]);
    }
}

#[test]
fn test_format_fills_whole_track() {
    let (mut engine, mut client) = setup_mounted();

    // dirty two sectors of track 2, then format with a nonzero sector field
    client
        .write_sector(&mut engine, 0, 2, 0, &[0x11; SECTOR_SIZE])
        .unwrap();
    client
        .write_sector(&mut engine, 0, 2, 35, &[0x22; SECTOR_SIZE])
        .unwrap();
    client.format_track(&mut engine, 0, 2).unwrap();

    let data = engine.storage().file_data("/DISK.P32").unwrap();
    let track = &data[2 * TRACK_SIZE..3 * TRACK_SIZE];
    assert!(track.iter().all(|&byte| byte == FORMAT_FILL));
    assert_eq!(data.len(), IMAGE_SIZE as usize);
}

#[test]
fn test_unmounted_drive_yields_invalid_drive() {
    let (mut engine, mut client) = setup();

    let err = client.read_sector(&mut engine, 1, 0, 0).unwrap_err();
    assert_eq!(err, HostError::Failed(Status::InvalidDrive.as_byte()));

    let err = client
        .write_sector(&mut engine, 3, 0, 0, &[0; SECTOR_SIZE])
        .unwrap_err();
    assert_eq!(err, HostError::Failed(Status::InvalidDrive.as_byte()));
}

#[test]
fn test_write_protect_on_read_only_mount() {
    let (mut engine, mut client) = setup();
    engine.mount_drive(0, "/DISK.P32", true).unwrap();

    let err = client
        .write_sector(&mut engine, 0, 0, 0, &[0; SECTOR_SIZE])
        .unwrap_err();
    assert_eq!(err, HostError::Failed(Status::WriteProtect.as_byte()));

    let err = client.format_track(&mut engine, 0, 0).unwrap_err();
    assert_eq!(err, HostError::Failed(Status::WriteProtect.as_byte()));

    // reads still fine
    client.read_sector(&mut engine, 0, 0, 0).unwrap();
}

#[test]
fn test_drive_selector_swap_on_the_wire() {
    // raw selector 0x40 (face value 1) addresses slot 2 and vice versa
    let (bus, host) = SimBus::pair();
    let storage = MemoryStorage::new();
    for (drive, marker) in [(0u8, 0xA0u8), (1, 0xA1), (2, 0xA2), (3, 0xA3)] {
        let path = format!("/D{drive}.P32");
        let mut image = vec![FORMAT_FILL; IMAGE_SIZE as usize];
        image[0] = marker;
        storage.add_file(&path, image);
    }
    let mut engine = Pmd32Engine::new(bus, storage);
    for drive in 0..4u8 {
        engine
            .mount_drive(drive, &format!("/D{drive}.P32"), false)
            .unwrap();
    }

    for (selector, expected_marker) in [(0x00u8, 0xA0u8), (0x40, 0xA2), (0x80, 0xA1), (0xC0, 0xA3)]
    {
        if !engine.is_linked() {
            host.queue(&[IDLE]);
        }
        host.queue(&[0x51, selector, 0x00, 0x51 ^ selector]);
        engine.poll();
        let sent = host.take_sent();
        let payload_at = sent.iter().position(|&b| b == ACK).unwrap() + 2;
        assert_eq!(sent[payload_at], expected_marker, "selector {selector:#04X}");
    }
}

#[test]
fn test_boot_sector_reads_drive_a_track_zero() {
    let (mut engine, mut client) = setup_mounted();
    client
        .write_sector(&mut engine, 0, 0, 0, &[0xB0; SECTOR_SIZE])
        .unwrap();

    let boot = client.read_boot(&mut engine).unwrap();
    assert_eq!(boot, vec![0xB0; SECTOR_SIZE]);
}

#[test]
fn test_change_drive_reports_mount_state() {
    let (mut engine, mut client) = setup_mounted();
    client.change_drive(&mut engine, 0).unwrap();

    let err = client.change_drive(&mut engine, 1).unwrap_err();
    assert_eq!(err, HostError::Failed(Status::InvalidDrive.as_byte()));
    let err = client.change_drive(&mut engine, 9).unwrap_err();
    assert_eq!(err, HostError::Failed(Status::InvalidDrive.as_byte()));
}

#[test]
fn test_inert_legacy_commands_answer_zeros() {
    let (mut engine, client) = setup_mounted();
    let host = client.host().clone();

    // one raw frame per legacy opcode: (opcode, argument count, zeros)
    for (opcode, args, zeros) in [
        (0x43u8, 4usize, 2usize), // read RAM
        (0x55, 5, 1),             // write RAM
        (0x4A, 2, 1),             // execute RAM
        (0x40, 0, 1),             // slow mode
        (0x2A, 0, 1),             // fast mode
    ] {
        let mut frame = vec![opcode];
        frame.extend(std::iter::repeat(0x5A).take(args));
        let crc = frame.iter().fold(0u8, |acc, byte| acc ^ byte);
        frame.push(crc);

        if !engine.is_linked() {
            host.queue(&[IDLE]);
        }
        host.queue(&frame);
        assert!(engine.poll(), "opcode {opcode:#04X} must count as traffic");

        let mut sent = host.take_sent();
        if sent.first() == Some(&IDLE) {
            sent.remove(0);
        }
        let mut expected = vec![ACK];
        expected.extend(std::iter::repeat(0u8).take(zeros));
        assert_eq!(sent, expected, "opcode {opcode:#04X}");
    }
}

#[test]
fn test_unknown_opcode_single_nak() {
    let (mut engine, client) = setup_mounted();
    client.host().queue(&[IDLE, 0x99 ^ 0x01]); // not an opcode
    assert!(!engine.poll());
    let sent = client.host().take_sent();
    assert_eq!(sent, vec![IDLE, NAK]);
}

#[test]
fn test_mount_unmount_cycle() {
    let (mut engine, mut client) = setup();

    let err = client.mount(&mut engine, 5, false, "DISK.P32").unwrap_err();
    assert_eq!(err, HostError::Failed(Status::InvalidDrive.as_byte()));

    client.mount(&mut engine, 0, false, "DISK.P32").unwrap();
    assert!(engine.drives().is_mounted(0));

    // mounting the same image elsewhere answers the NAK result byte
    let err = client.mount(&mut engine, 1, false, "DISK.P32").unwrap_err();
    assert_eq!(err, HostError::Failed(NAK));

    // length 0 unmounts, and is fine to repeat
    client.unmount(&mut engine, 0).unwrap();
    assert!(!engine.drives().is_mounted(0));
    client.unmount(&mut engine, 0).unwrap();

    // 0xFF remounts the stored path with a new write flag
    client.remount(&mut engine, 0, true).unwrap();
    assert!(engine.drives().is_mounted(0));
    assert!(!engine.drives_mut().writable(0));
}

#[test]
fn test_mount_error_codes() {
    let (mut engine, mut client) = setup();
    engine.storage().add_file("/SHORT.P32", vec![0u8; 100]);

    let err = client.mount(&mut engine, 0, false, "NOPE.P32").unwrap_err();
    assert_eq!(err, HostError::Failed(Status::PathNotFound.as_byte()));

    let err = client.mount(&mut engine, 0, false, "SHORT.P32").unwrap_err();
    assert_eq!(err, HostError::Failed(Status::ImageUnknown.as_byte()));
}

#[test]
fn test_get_image_path_and_truncation() {
    let (mut engine, mut client) = setup_mounted();

    let (wp, path) = client.get_image_path(&mut engine, 0).unwrap();
    assert!(!wp);
    assert_eq!(path, "DISK.P32"); // root marker stripped

    let (wp, path) = client.get_image_path(&mut engine, 1).unwrap();
    assert!(!wp);
    assert_eq!(path, "");

    let err = client.get_image_path(&mut engine, 4).unwrap_err();
    assert_eq!(err, HostError::Failed(Status::InvalidDrive.as_byte()));

    // a path beyond the wire limit arrives truncated to 63 bytes
    let long_dir = "L".repeat(80);
    let long_path = format!("/{long_dir}/A.P32");
    engine.storage().add_image(&long_path);
    engine.mount_drive(2, &long_path, false).unwrap();
    let (_, path) = client.get_image_path(&mut engine, 2).unwrap();
    assert_eq!(path.len(), 63);
    assert!(path.starts_with("LLL"));
}

#[test]
fn test_cwd_navigation() {
    let (mut engine, mut client) = setup();
    engine.storage().add_dir("/GAMES/ARCADE");

    assert_eq!(client.get_cwd(&mut engine).unwrap(), "");

    client.change_cwd(&mut engine, "GAMES").unwrap();
    assert_eq!(client.get_cwd(&mut engine).unwrap(), "GAMES/");

    client.change_cwd(&mut engine, "ARCADE").unwrap();
    assert_eq!(client.get_cwd(&mut engine).unwrap(), "GAMES/ARCADE/");

    // "." is a no-op
    client.change_cwd(&mut engine, ".").unwrap();
    assert_eq!(client.get_cwd(&mut engine).unwrap(), "GAMES/ARCADE/");

    // ".." one level up, and stops at root
    client.change_cwd(&mut engine, "..").unwrap();
    assert_eq!(client.get_cwd(&mut engine).unwrap(), "GAMES/");
    client.change_cwd(&mut engine, "..").unwrap();
    client.change_cwd(&mut engine, "..").unwrap();
    assert_eq!(client.get_cwd(&mut engine).unwrap(), "");

    let err = client.change_cwd(&mut engine, "MISSING").unwrap_err();
    assert_eq!(err, HostError::Failed(Status::PathNotFound.as_byte()));
    assert_eq!(client.get_cwd(&mut engine).unwrap(), "");
}

#[test]
fn test_cwd_too_long_rolls_back() {
    let (mut engine, mut client) = setup();
    let name = "D".repeat(70);
    engine.storage().add_dir(&format!("/{name}"));

    let err = client.change_cwd(&mut engine, &name).unwrap_err();
    assert_eq!(err, HostError::Failed(Status::PathTooLong.as_byte()));
    assert_eq!(client.get_cwd(&mut engine).unwrap(), "");
}

#[test]
fn test_dir_listing_enumeration() {
    let (mut engine, mut client) = setup();
    let storage = engine.storage().clone();
    storage.add_dir("/GAMES");
    storage.add_file("/disk1.p32", vec![0u8; 10]);
    storage.add_file("/readme.txt", vec![0u8; 10]);
    storage.add_file("/.secret.p32", vec![0u8; 10]);

    // reset at root synthesizes "[.]"
    assert_eq!(
        client.list_dir(&mut engine, true).unwrap(),
        ListEntry::Name("[.]".to_string())
    );
    // directories come bracketed, non-images and hidden entries are skipped
    assert_eq!(
        client.list_dir(&mut engine, false).unwrap(),
        ListEntry::Name("[GAMES]".to_string())
    );
    assert_eq!(
        client.list_dir(&mut engine, false).unwrap(),
        ListEntry::Name("disk1.p32".to_string())
    );
    assert_eq!(client.list_dir(&mut engine, false).unwrap(), ListEntry::End);
    // the cursor is gone; further calls keep answering the empty name
    assert_eq!(client.list_dir(&mut engine, false).unwrap(), ListEntry::End);

    // below root the first entry is "[..]"
    client.change_cwd(&mut engine, "GAMES").unwrap();
    assert_eq!(
        client.list_dir(&mut engine, true).unwrap(),
        ListEntry::Name("[..]".to_string())
    );
    assert_eq!(client.list_dir(&mut engine, false).unwrap(), ListEntry::End);
}

#[test]
fn test_create_image_blank_and_unmounted() {
    let (mut engine, mut client) = setup();

    client.create_image(&mut engine, "FRESH").unwrap();

    // extension appended, content formatted end to end, nothing mounted
    let data = engine.storage().file_data("/FRESH.p32").unwrap();
    assert_eq!(data.len(), IMAGE_SIZE as usize);
    assert!(data.iter().all(|&byte| byte == FORMAT_FILL));
    assert_eq!(engine.drives().mounted_count(), 0);

    // and it mounts cleanly afterwards
    client.mount(&mut engine, 1, false, "FRESH.p32").unwrap();

    let err = client
        .create_image(&mut engine, &"N".repeat(80))
        .unwrap_err();
    assert_eq!(err, HostError::Failed(Status::PathTooLong.as_byte()));
}

#[test]
fn test_image_info_geometry() {
    let (mut engine, mut client) = setup_mounted();

    assert_eq!(client.image_info(&mut engine, 0).unwrap(), (80, 36, 2));
    assert_eq!(client.image_info(&mut engine, 1).unwrap(), (0, 0, 0));

    let err = client.image_info(&mut engine, 4).unwrap_err();
    assert_eq!(err, HostError::Failed(Status::InvalidDrive.as_byte()));
}

#[test]
fn test_bad_checksum_leaves_storage_untouched() {
    let (mut engine, client) = setup_mounted();

    let mut frame = vec![0x54u8, 0x00, 0x05];
    frame.extend(std::iter::repeat(0x77).take(SECTOR_SIZE));
    frame.push(0x00); // checksum that cannot be right
    client.host().queue(&[IDLE]);
    client.host().queue(&frame);
    engine.poll();

    let sent = client.host().take_sent();
    assert_eq!(sent, vec![IDLE, NAK]);

    let data = engine.storage().file_data("/DISK.P32").unwrap();
    let track = &data[5 * TRACK_SIZE..6 * TRACK_SIZE];
    assert!(track.iter().all(|&byte| byte == FORMAT_FILL));
}

#[test]
fn test_automount_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("automount.json");

    // first session: create and mount an image, persist the table
    {
        let (bus, host) = SimBus::pair();
        let mut engine = Pmd32Engine::new(bus, DiskStorage::new(dir.path()));
        let mut client = HostClient::new(host);
        client.create_image(&mut engine, "SAVED").unwrap();
        client.mount(&mut engine, 0, true, "SAVED.p32").unwrap();

        let store = AutoMountStore::capture(engine.drives_mut());
        store.save(&store_path).unwrap();
    }

    // second session: restore from the file
    {
        let (bus, mut host_client) = {
            let (bus, host) = SimBus::pair();
            (bus, HostClient::new(host))
        };
        let mut engine = Pmd32Engine::new(bus, DiskStorage::new(dir.path()));
        let store = AutoMountStore::load(&store_path).unwrap();
        let storage = DiskStorage::new(dir.path());
        let mut probe = storage;
        assert_eq!(store.restore(&mut probe, engine.drives_mut()), 1);

        assert!(engine.drives().is_mounted(0));
        assert!(!engine.drives_mut().writable(0));
        let payload = host_client.read_sector(&mut engine, 0, 0, 0).unwrap();
        assert_eq!(payload, vec![FORMAT_FILL; SECTOR_SIZE]);
    }
}
