use std::env;

use blockfs::{FileSystem, Geometry, OpenMode};

/// Opens (or creates) the image named on the command line, appends one line
/// to `/log` and prints the memory map.
pub fn main() -> Result<(), blockfs::FsError> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    let image = args.get(1).map(String::as_str).unwrap_or("sample.dat");

    let mut fs = FileSystem::open_image(image, Geometry::default())?;
    let line = format!("run with {} blocks free\n", fs.free_blocks());
    let log = fs.open("/log", OpenMode::Append)?;
    fs.write_to_file(log, line.as_bytes(), None)?;
    fs.close(log)?;
    fs.sync()?;

    print!("{}", fs.show_memory_map());
    Ok(())
}
