// End-to-end scenarios against in-memory and file-backed devices. The
// background daemons stay off so every test is deterministic; syncing
// and checkpointing happen explicitly.

use std::sync::Arc;

use rusty_sfs::layout::{Dinode, BLOCK_SIZE};
use rusty_sfs::{BlockDevice, FileDevice, MemDevice, MountOptions, SfsError, SfsVolume};

fn quiet_options() -> MountOptions {
    MountOptions {
        run_syncer: false,
        run_checkpointer: false,
        ..Default::default()
    }
}

fn fresh_volume(nblocks: u32, jblocks: u32) -> (Arc<SfsVolume>, Arc<MemDevice>) {
    let mem = Arc::new(MemDevice::new(nblocks));
    SfsVolume::format(
        Arc::clone(&mem) as Arc<dyn BlockDevice>,
        "testvol",
        Some(jblocks),
    )
    .unwrap();
    let vol = SfsVolume::mount(Arc::clone(&mem) as Arc<dyn BlockDevice>, quiet_options()).unwrap();
    (vol, mem)
}

fn count_used(vol: &SfsVolume) -> usize {
    (0..vol.nblocks()).filter(|&b| vol.block_is_used(b)).count()
}

#[test]
fn mount_empty_volume() {
    let (vol, _mem) = fresh_volume(200, 40);
    assert_eq!(vol.volume_name(), "testvol");

    let root = vol.root().unwrap();
    let mut names: Vec<String> = vol
        .read_dir(&root)
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    names.sort();
    assert_eq!(names, vec![".".to_string(), "..".to_string()]);

    let st = vol.stat(&root).unwrap();
    assert_eq!(st.linkcount, 2);

    drop(root);
    vol.unmount().unwrap();
}

#[test]
fn create_small_file() {
    let (vol, mem) = fresh_volume(200, 40);
    let root = vol.root().unwrap();

    let a = vol.create(&root, "a", true).unwrap();

    let mut names: Vec<String> = vol
        .read_dir(&root)
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![".".to_string(), "..".to_string(), "a".to_string()]
    );

    let st = vol.stat(&a).unwrap();
    assert_eq!(st.size, 0);
    assert_eq!(st.linkcount, 1);

    vol.sync().unwrap();
    let dino = Dinode::decode(&mem.raw_block(a.ino()));
    assert_eq!(dino.size, 0);
    assert_eq!(dino.linkcount, 1);
    assert!(dino.direct.iter().all(|&d| d == 0));
    assert_eq!(dino.indirect, 0);
    assert_eq!(dino.dindirect, 0);
    assert_eq!(dino.tindirect, 0);

    drop(a);
    drop(root);
    vol.unmount().unwrap();
}

#[test]
fn create_exclusive_semantics() {
    let (vol, _mem) = fresh_volume(200, 40);
    let root = vol.root().unwrap();

    let first = vol.create(&root, "x", true).unwrap();
    assert!(matches!(
        vol.create(&root, "x", true),
        Err(SfsError::Exists)
    ));
    let second = vol.create(&root, "x", false).unwrap();
    assert_eq!(first.ino(), second.ino());
}

#[test]
fn write_across_block_boundary() {
    let (vol, mem) = fresh_volume(200, 40);
    let root = vol.root().unwrap();

    let b = vol.create(&root, "b", true).unwrap();
    let data = vec![0xabu8; 600];
    assert_eq!(vol.write_at(&b, 0, &data).unwrap(), 600);

    assert_eq!(vol.stat(&b).unwrap().size, 600);

    let mut back = vec![0u8; 600];
    assert_eq!(vol.read_at(&b, 0, &mut back).unwrap(), 600);
    assert!(back.iter().all(|&x| x == 0xab));

    // Reading at or past EOF returns nothing.
    let mut tail = [0u8; 16];
    assert_eq!(vol.read_at(&b, 600, &mut tail).unwrap(), 0);
    assert_eq!(vol.read_at(&b, 700, &mut tail).unwrap(), 0);

    vol.sync().unwrap();
    let dino = Dinode::decode(&mem.raw_block(b.ino()));
    assert_eq!(dino.size, 600);
    assert_ne!(dino.direct[0], 0);
    assert_ne!(dino.direct[1], 0);
    assert_eq!(dino.direct[2], 0);

    // The second block holds 88 bytes of data; the rest is zero on
    // disk because the block was cleared at allocation.
    let raw = mem.raw_block(dino.direct[1]);
    assert!(raw[..88].iter().all(|&x| x == 0xab));
    assert!(raw[88..].iter().all(|&x| x == 0));

    drop(b);
    drop(root);
    vol.unmount().unwrap();
}

#[test]
fn truncate_frees_everything() {
    // 200 KB needs 400 data blocks plus indirect blocks, so this runs
    // on a larger volume with the same journal fraction.
    let (vol, mem) = fresh_volume(4000, 200);
    let root = vol.root().unwrap();
    let baseline = count_used(&vol);

    let c = vol.create(&root, "c", true).unwrap();
    let chunk = vec![0xcdu8; 8192];
    for i in 0..25u32 {
        assert_eq!(vol.write_at(&c, i * 8192, &chunk).unwrap(), 8192);
    }
    assert_eq!(vol.stat(&c).unwrap().size, 204_800);

    vol.sync().unwrap();
    vol.checkpoint();

    // 400 data blocks, the inode, and at least the single and double
    // indirect blocks.
    assert!(count_used(&vol) >= baseline + 403);

    // Spot-check the data survived the round trip.
    let mut back = vec![0u8; 8192];
    assert_eq!(vol.read_at(&c, 12 * 8192, &mut back).unwrap(), 8192);
    assert!(back.iter().all(|&x| x == 0xcd));

    vol.truncate(&c, 0).unwrap();

    let st = vol.stat(&c).unwrap();
    assert_eq!(st.size, 0);
    assert_eq!(st.linkcount, 1);

    vol.sync().unwrap();
    let dino = Dinode::decode(&mem.raw_block(c.ino()));
    assert_eq!(dino.size, 0);
    assert!(dino.direct.iter().all(|&d| d == 0));
    assert_eq!(dino.indirect, 0);
    assert_eq!(dino.dindirect, 0);
    assert_eq!(dino.tindirect, 0);

    // Everything is free again except the inode itself.
    assert_eq!(count_used(&vol), baseline + 1);

    drop(c);
    drop(root);
    vol.unmount().unwrap();
}

#[test]
fn truncate_is_idempotent() {
    let (vol, mem) = fresh_volume(1000, 50);
    let root = vol.root().unwrap();

    let f = vol.create(&root, "f", true).unwrap();
    let data = vec![0x3cu8; 20000];
    vol.write_at(&f, 0, &data).unwrap();

    vol.truncate(&f, 4000).unwrap();
    vol.sync().unwrap();
    let first: Vec<Vec<u8>> = (0..1000).map(|b| mem.raw_block(b)).collect();

    // Truncating to the same length again changes nothing on disk.
    vol.truncate(&f, 4000).unwrap();
    vol.sync().unwrap();
    let second: Vec<Vec<u8>> = (0..1000).map(|b| mem.raw_block(b)).collect();
    assert_eq!(first, second);

    drop(f);
    drop(root);
    vol.unmount().unwrap();
}

#[test]
fn sparse_files_read_as_zeros() {
    let (vol, _mem) = fresh_volume(400, 20);
    let root = vol.root().unwrap();

    let f = vol.create(&root, "sparse", true).unwrap();
    let pattern: Vec<u8> = (0..777u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(vol.write_at(&f, 10_000, &pattern).unwrap(), 777);
    assert_eq!(vol.stat(&f).unwrap().size, 10_777);

    // The hole before the data reads as zeros.
    let mut hole = vec![0xffu8; 10_000];
    assert_eq!(vol.read_at(&f, 0, &mut hole).unwrap(), 10_000);
    assert!(hole.iter().all(|&x| x == 0));

    let mut back = vec![0u8; 777];
    assert_eq!(vol.read_at(&f, 10_000, &mut back).unwrap(), 777);
    assert_eq!(back, pattern);

    // An unaligned write spanning a block boundary.
    let stitch = [1u8, 2, 3, 4, 5, 6];
    vol.write_at(&f, (BLOCK_SIZE - 3) as u32, &stitch).unwrap();
    let mut readback = [0u8; 6];
    vol.read_at(&f, (BLOCK_SIZE - 3) as u32, &mut readback).unwrap();
    assert_eq!(readback, stitch);

    drop(f);
    drop(root);
    vol.unmount().unwrap();
}

#[test]
fn remove_keeps_open_file_until_last_reference() {
    let (vol, _mem) = fresh_volume(200, 40);
    let root = vol.root().unwrap();
    let baseline = count_used(&vol);

    let e = vol.create(&root, "e", true).unwrap();
    let data = vec![0x77u8; 1000];
    vol.write_at(&e, 0, &data).unwrap();

    vol.remove(&root, "e").unwrap();

    // The name is gone but the storage survives while the handle
    // lives.
    assert!(matches!(vol.lookup(&root, "e"), Err(SfsError::NoSuchFile)));
    assert_eq!(vol.stat(&e).unwrap().linkcount, 0);
    let mut back = vec![0u8; 1000];
    assert_eq!(vol.read_at(&e, 0, &mut back).unwrap(), 1000);
    assert_eq!(back, data);

    // Dropping the last handle releases the inode and its blocks. One
    // block stays behind: the graveyard directory grew its first data
    // block to track the orphan, and directories never shrink.
    drop(e);
    assert_eq!(count_used(&vol), baseline + 1);

    drop(root);
    vol.unmount().unwrap();
}

#[test]
fn link_and_rename() {
    let (vol, _mem) = fresh_volume(200, 40);
    let root = vol.root().unwrap();

    let f = vol.create(&root, "orig", true).unwrap();
    vol.write_at(&f, 0, b"payload").unwrap();

    vol.link(&root, "alias", &f).unwrap();
    assert_eq!(vol.stat(&f).unwrap().linkcount, 2);
    let alias = vol.lookup(&root, "alias").unwrap();
    assert_eq!(alias.ino(), f.ino());

    vol.rename(&root, "orig", "renamed").unwrap();
    assert!(matches!(
        vol.lookup(&root, "orig"),
        Err(SfsError::NoSuchFile)
    ));
    let renamed = vol.lookup(&root, "renamed").unwrap();
    assert_eq!(renamed.ino(), f.ino());
    assert_eq!(vol.stat(&f).unwrap().linkcount, 2);

    // Renaming on top of an existing name is refused.
    vol.create(&root, "other", true).unwrap();
    assert!(matches!(
        vol.rename(&root, "renamed", "other"),
        Err(SfsError::Exists)
    ));

    vol.remove(&root, "alias").unwrap();
    assert_eq!(vol.stat(&f).unwrap().linkcount, 1);

    drop(renamed);
    drop(alias);
    drop(f);
    drop(root);
    // "other" still exists; volume unmounts once handles are gone.
    vol.unmount().unwrap();
}

#[test]
fn type_errors_are_reported() {
    let (vol, _mem) = fresh_volume(200, 40);
    let root = vol.root().unwrap();
    let f = vol.create(&root, "plain", true).unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(
        vol.read_at(&root, 0, &mut buf),
        Err(SfsError::IsADirectory)
    ));
    assert!(matches!(
        vol.write_at(&root, 0, b"zz"),
        Err(SfsError::IsADirectory)
    ));
    assert!(matches!(
        vol.truncate(&root, 0),
        Err(SfsError::IsADirectory)
    ));
    assert!(matches!(
        vol.lookup(&f, "sub"),
        Err(SfsError::NotADirectory)
    ));
    assert!(matches!(
        vol.remove(&root, "."),
        Err(SfsError::IsADirectory)
    ));
    assert!(matches!(
        vol.remove(&root, "nonesuch"),
        Err(SfsError::NoSuchFile)
    ));
}

#[test]
fn oversize_offsets_report_file_too_big() {
    let (vol, _mem) = fresh_volume(200, 40);
    let root = vol.root().unwrap();
    let f = vol.create(&root, "big", true).unwrap();

    assert!(matches!(
        vol.write_at(&f, u32::MAX - 16, b"far"),
        Err(SfsError::FileTooBig)
    ));
}

#[test]
fn unmount_refuses_open_files() {
    let (vol, _mem) = fresh_volume(200, 40);
    let root = vol.root().unwrap();
    assert!(matches!(vol.unmount(), Err(SfsError::Busy)));
    drop(root);
    vol.unmount().unwrap();
}

#[test]
fn data_persists_across_unmount_and_remount() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.img");
    let dev = Arc::new(FileDevice::create(&path, 400).unwrap());
    SfsVolume::format(Arc::clone(&dev) as Arc<dyn BlockDevice>, "persist", Some(20)).unwrap();

    let pattern: Vec<u8> = (0..3000u32).map(|i| (i * 7 % 256) as u8).collect();
    {
        let vol = SfsVolume::mount(dev, quiet_options()).unwrap();
        let root = vol.root().unwrap();
        let f = vol.create(&root, "keep", true).unwrap();
        vol.write_at(&f, 0, &pattern).unwrap();
        drop(f);
        drop(root);
        vol.unmount().unwrap();
    }

    let dev = Arc::new(FileDevice::open(&path).unwrap());
    let vol = SfsVolume::mount(dev as Arc<dyn BlockDevice>, quiet_options()).unwrap();
    assert_eq!(vol.volume_name(), "persist");
    let root = vol.root().unwrap();
    let f = vol.lookup(&root, "keep").unwrap();
    assert_eq!(vol.stat(&f).unwrap().size, 3000);
    let mut back = vec![0u8; 3000];
    assert_eq!(vol.read_at(&f, 0, &mut back).unwrap(), 3000);
    assert_eq!(back, pattern);

    drop(f);
    drop(root);
    vol.unmount().unwrap();
}

#[test]
fn concurrent_writers_on_separate_files() {
    let (vol, _mem) = fresh_volume(2000, 100);
    let root = vol.root().unwrap();

    let mut handles = Vec::new();
    for t in 0..4u8 {
        let vol = Arc::clone(&vol);
        let root = root.clone();
        handles.push(std::thread::spawn(move || {
            let name = format!("t{t}");
            let f = vol.create(&root, &name, true).unwrap();
            let data = vec![t + 1; 5000];
            assert_eq!(vol.write_at(&f, 0, &data).unwrap(), 5000);
            let mut back = vec![0u8; 5000];
            assert_eq!(vol.read_at(&f, 0, &mut back).unwrap(), 5000);
            assert_eq!(back, data);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Everything written is still readable after a sync.
    vol.sync().unwrap();
    for t in 0..4u8 {
        let f = vol.lookup(&root, &format!("t{t}")).unwrap();
        let mut back = vec![0u8; 5000];
        assert_eq!(vol.read_at(&f, 0, &mut back).unwrap(), 5000);
        assert!(back.iter().all(|&x| x == t + 1));
    }

    drop(root);
    vol.unmount().unwrap();
}

#[test]
fn background_daemons_run() {
    let mem = Arc::new(MemDevice::new(400));
    SfsVolume::format(Arc::clone(&mem) as Arc<dyn BlockDevice>, "daemons", Some(20)).unwrap();
    let vol = SfsVolume::mount(
        Arc::clone(&mem) as Arc<dyn BlockDevice>,
        MountOptions::default(),
    )
    .unwrap();

    let root = vol.root().unwrap();
    let f = vol.create(&root, "bg", true).unwrap();
    vol.write_at(&f, 0, &[9u8; 2000]).unwrap();

    drop(f);
    drop(root);
    vol.unmount().unwrap();
}
