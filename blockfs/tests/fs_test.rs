use blockfs::io::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder};
use blockfs::{FileHandle, FileSystem, FsError, Geometry, OpenMode};
use tempfile::NamedTempFile;

fn device(geometry: &Geometry) -> FileBlockEmulator {
    FileBlockEmulatorBuilder::from(tempfile::tempfile().unwrap())
        .with_capacity(geometry.capacity())
        .build()
        .expect("Could not initialize disk emulator.")
}

fn fresh(geometry: Geometry) -> FileSystem<FileBlockEmulator> {
    FileSystem::format(device(&geometry), geometry).unwrap()
}

fn remount(fs: FileSystem<FileBlockEmulator>) -> FileSystem<FileBlockEmulator> {
    let geometry = *fs.geometry();
    FileSystem::mount(fs.into_device(), geometry).unwrap()
}

fn contents(fs: &mut FileSystem<FileBlockEmulator>, handle: FileHandle) -> Vec<u8> {
    fs.read_from_file(handle, None).unwrap()
}

#[test]
fn can_initialize_disk_with_filesystem() {
    let tf = NamedTempFile::new().unwrap();
    let geometry = Geometry::default();

    // Prepare the medium with the file system layout.
    let dev = FileBlockEmulatorBuilder::from(tf.reopen().unwrap())
        .with_capacity(geometry.capacity())
        .build()
        .unwrap();
    FileSystem::format(dev, geometry).unwrap();

    // Reattach without clearing and verify the initial layout.
    let dev = FileBlockEmulatorBuilder::from(tf.reopen().unwrap())
        .with_capacity(geometry.capacity())
        .clear_medium(false)
        .build()
        .unwrap();
    let fs = FileSystem::mount(dev, geometry).unwrap();
    assert!(fs.ls().is_empty());
    assert_eq!(fs.free_blocks(), 220);
    fs.verify().unwrap();
}

#[test]
fn unformatted_medium_is_rejected() {
    let geometry = Geometry::default();
    let result = FileSystem::mount(device(&geometry), geometry);
    assert!(matches!(result, Err(FsError::CorruptSnapshot(_))));
}

#[test]
fn mounting_with_another_layout_is_rejected() {
    let fs = fresh(Geometry::default());
    let other = Geometry::new(64, 3200, 10240).unwrap();
    let result = FileSystem::mount(fs.into_device(), other);
    assert!(matches!(result, Err(FsError::CorruptSnapshot(_))));
}

#[test]
fn snapshot_with_a_bad_block_address_is_rejected() {
    let geometry = Geometry::default();
    let mut fs = fresh(geometry);
    let h = fs.open("f", OpenMode::Write).unwrap();
    fs.write_to_file(h, &[7; 40], None).unwrap();
    let mut dev = fs.into_device();

    // Point the file's first block one byte off its boundary.
    let mut region = vec![0; geometry.metadata_size() as usize];
    dev.read_at(0, &mut region).unwrap();
    // The 40 byte header also records 3200 as the metadata size.
    let first = 3200_u64.to_le_bytes();
    let at = 40 + region[40..]
        .windows(first.len())
        .position(|w| w == &first[..])
        .expect("block address in snapshot");
    region[at..at + first.len()].copy_from_slice(&3201_u64.to_le_bytes());
    dev.write_at(0, &region).unwrap();

    let result = FileSystem::mount(dev, geometry);
    assert!(matches!(result, Err(FsError::CorruptSnapshot(_))));
}

#[test]
fn huge_arguments_are_out_of_space() {
    let mut fs = fresh(Geometry::default());
    let h = fs.open("f", OpenMode::WriteUpdate).unwrap();
    fs.write_to_file(h, b"keep", None).unwrap();

    assert!(matches!(fs.truncate_file(h, u64::MAX), Err(FsError::OutOfSpace)));
    assert!(matches!(
        fs.move_within_file(h, i64::MAX, 0, i64::MAX),
        Err(FsError::OutOfSpace)
    ));
    assert!(matches!(fs.write_to_file(h, b"x", Some(i64::MAX)), Err(FsError::OutOfSpace)));

    assert_eq!(contents(&mut fs, h), b"keep");
    assert_eq!(fs.free_blocks(), 219);
    fs.verify().unwrap();
}

#[test]
fn image_is_created_once_and_reopened() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("sample.dat");

    {
        let mut fs = FileSystem::open_image(&image, Geometry::default()).unwrap();
        let h = fs.open("/docs/readme", OpenMode::Write).unwrap();
        fs.write_to_file(h, b"persisted", None).unwrap();
        fs.sync().unwrap();
    }

    let mut fs = FileSystem::open_image(&image, Geometry::default()).unwrap();
    fs.chdir("docs").unwrap();
    let h = fs.open("readme", OpenMode::Read).unwrap();
    assert_eq!(contents(&mut fs, h), b"persisted");
}

#[test]
fn forty_bytes_then_truncate_to_ten() {
    let mut fs = fresh(Geometry::default());
    fs.create("a").unwrap();
    let h = fs.open("a", OpenMode::ReadUpdate).unwrap();

    fs.write_to_file(h, &[b'x'; 40], None).unwrap();
    let stat = fs.stat(h).unwrap();
    assert_eq!((stat.size, stat.blocks.len()), (40, 2));
    assert_eq!(fs.free_blocks(), 218);

    assert_eq!(fs.truncate_file(h, 10).unwrap(), 1);
    let stat = fs.stat(h).unwrap();
    assert_eq!((stat.size, stat.blocks.len()), (10, 1));
    assert_eq!(fs.free_blocks(), 219);
    assert_eq!(contents(&mut fs, h), vec![b'x'; 10]);

    // The freed block is the first one handed out again.
    let other = fs.open("b", OpenMode::Write).unwrap();
    fs.write_to_file(other, b"!", None).unwrap();
    assert_eq!(fs.stat(other).unwrap().blocks, vec![3232]);
}

#[test]
fn move_within_overlapping_spans() {
    let mut fs = fresh(Geometry::default());
    let h = fs.open("f", OpenMode::WriteUpdate).unwrap();
    fs.write_to_file(h, b"ABCDEFGH", Some(0)).unwrap();

    fs.move_within_file(h, 2, 0, 4).unwrap();
    assert_eq!(contents(&mut fs, h), b"CDEF\0\0GH");
}

#[test]
fn read_after_write_for_many_lengths() {
    let mut fs = fresh(Geometry::default());
    for len in [0, 1, 31, 32, 33, 64, 65, 200] {
        let h = fs.open("f", OpenMode::WriteUpdate).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8 + 1).collect();
        fs.write_to_file(h, &data, Some(0)).unwrap();
        assert_eq!(fs.read_from_file(h, Some((0, len as i64))).unwrap(), data);
        fs.close(h).unwrap();
    }
    fs.verify().unwrap();
}

#[test]
fn writing_past_the_end_reads_back_zeroes() {
    let mut fs = fresh(Geometry::default());
    let h = fs.open("f", OpenMode::WriteUpdate).unwrap();
    fs.write_to_file(h, b"head", None).unwrap();
    fs.write_to_file(h, b"tail", Some(100)).unwrap();

    assert_eq!(fs.read_from_file(h, Some((4, 96))).unwrap(), vec![0; 96]);
    assert_eq!(fs.read_from_file(h, Some((100, 4))).unwrap(), b"tail");
    assert!(fs.read_from_file(h, Some((105, 4))).unwrap().is_empty());
    let stat = fs.stat(h).unwrap();
    assert_eq!((stat.size, stat.blocks.len()), (104, 4));
}

#[test]
fn snapshot_survives_remount() {
    let mut fs = fresh(Geometry::default());
    fs.mkdir("/a/b").unwrap();
    fs.create("/a/empty").unwrap();
    for (path, len) in [("/a/b/one", 50), ("/two", 7), ("/a/three", 64)] {
        let h = fs.open(path, OpenMode::Write).unwrap();
        fs.write_to_file(h, &vec![len as u8; len], None).unwrap();
        fs.close(h).unwrap();
    }
    fs.delete_file("/two").unwrap();
    let map = fs.show_memory_map();
    let free = fs.free_blocks();

    let mut fs = remount(fs);
    assert_eq!(fs.show_memory_map(), map);
    assert_eq!(fs.free_blocks(), free);
    fs.verify().unwrap();

    let h = fs.open("/a/b/one", OpenMode::Read).unwrap();
    assert_eq!(contents(&mut fs, h), vec![50; 50]);
}

#[test]
fn oversized_snapshot_keeps_the_last_good_one() {
    let geometry = Geometry::new(32, 256, 256 + 32 * 8).unwrap();
    let mut fs = fresh(geometry);

    let mut created = Vec::new();
    let mut rejected = false;
    for i in 0..32 {
        let name = format!("file{:02}", i);
        match fs.create(&name) {
            Ok(()) => created.push(name),
            Err(FsError::SnapshotTooLarge { budget, .. }) => {
                assert_eq!(budget, 256);
                rejected = true;
                break;
            }
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    assert!(rejected);
    assert!(!created.is_empty());

    let fs = remount(fs);
    let names: Vec<String> = fs.ls().into_iter().map(|e| e.name).collect();
    assert_eq!(names, created);
}

#[test]
fn out_of_space_changes_nothing() {
    let geometry = Geometry::new(32, 256, 256 + 32 * 4).unwrap();
    let mut fs = fresh(geometry);
    let f = fs.open("f", OpenMode::WriteUpdate).unwrap();
    fs.write_to_file(f, &[3; 100], None).unwrap();
    assert_eq!(fs.free_blocks(), 0);

    let g = fs.open("g", OpenMode::WriteUpdate).unwrap();
    assert!(matches!(fs.write_to_file(g, b"x", None), Err(FsError::OutOfSpace)));
    assert!(matches!(fs.write_to_file(f, b"x", Some(128)), Err(FsError::OutOfSpace)));
    assert!(matches!(fs.truncate_file(g, 1), Err(FsError::OutOfSpace)));

    assert_eq!(fs.stat(g).unwrap().size, 0);
    assert_eq!(contents(&mut fs, f), vec![3; 100]);
    fs.verify().unwrap();

    // Truncating f makes room for g.
    fs.truncate_file(f, 64).unwrap();
    fs.write_to_file(g, b"x", None).unwrap();
    fs.verify().unwrap();
}

/// Small deterministic generator so the mixed workload is reproducible.
struct Lcg(u64);

impl Lcg {
    fn below(&mut self, n: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % n
    }
}

fn model_write(model: &mut Vec<u8>, data: &[u8], at: usize) {
    if model.len() < at + data.len() {
        model.resize(at + data.len(), 0);
    }
    model[at..at + data.len()].copy_from_slice(data);
}

#[test]
fn mixed_workload_matches_a_byte_vector_model() {
    let mut fs = fresh(Geometry::default());
    let mut rng = Lcg(0x5eed);
    let names = ["/x", "/d/y", "/d/e/z"];
    let handles: Vec<FileHandle> = names
        .iter()
        .map(|name| fs.open(name, OpenMode::WriteUpdate).unwrap())
        .collect();
    let mut models = vec![Vec::new(); names.len()];

    for step in 0..300 {
        let which = rng.below(names.len() as u64) as usize;
        let (h, model) = (handles[which], &mut models[which]);
        let fill = (step % 250) as u8 + 1;
        match rng.below(4) {
            0 => {
                let data = vec![fill; rng.below(80) as usize];
                fs.write_to_file(h, &data, None).unwrap();
                model.extend_from_slice(&data);
            }
            1 => {
                let at = rng.below(200) as usize;
                let data = vec![fill; rng.below(50) as usize];
                fs.write_to_file(h, &data, Some(at as i64)).unwrap();
                if at > model.len() {
                    model.resize(at, 0);
                }
                model_write(model, &data, at);
            }
            2 => {
                let size = rng.below(150) as usize;
                fs.truncate_file(h, size as u64).unwrap();
                model.resize(size, 0);
            }
            _ => {
                let (src, dst, len) = (rng.below(150) as usize, rng.below(150) as usize, rng.below(40) as usize);
                fs.move_within_file(h, src as i64, dst as i64, len as i64).unwrap();
                let captured = if src >= model.len() {
                    Vec::new()
                } else {
                    model[src..(src + len).min(model.len())].to_vec()
                };
                model_write(model, &vec![0; len], src);
                model_write(model, &captured, dst);
            }
        }

        assert_eq!(contents(&mut fs, h), *model, "step {}", step);
        let stat = fs.stat(h).unwrap();
        assert_eq!(stat.blocks.len() as u64, (stat.size + 31) / 32);
        fs.verify().unwrap();
    }

    // Everything written is still there after a remount.
    let mut fs = remount(fs);
    for (name, model) in names.iter().zip(&models) {
        let h = fs.open(name, OpenMode::Read).unwrap();
        assert_eq!(contents(&mut fs, h), *model);
        fs.close(h).unwrap();
    }
}
