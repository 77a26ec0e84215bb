use blockfs::io::FileBlockEmulatorBuilder;
use blockfs::{FileSystem, Geometry, OpenMode};

pub fn main() -> Result<(), blockfs::FsError> {
    env_logger::init();
    let geometry = Geometry::default();
    let tmp = tempfile::tempfile()?;
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_capacity(geometry.capacity())
        .build()?;

    // create a new file system on the device and write one file
    let mut fs = FileSystem::format(dev, geometry)?;
    let hello = fs.open("/hello.txt", OpenMode::WriteUpdate)?;
    fs.write_to_file(hello, b"hello, blocks", None)?;
    println!("{}", String::from_utf8_lossy(&fs.read_from_file(hello, None)?));
    fs.close(hello)?;
    print!("{}", fs.show_memory_map());
    Ok(())
}
