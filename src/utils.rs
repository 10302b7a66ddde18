use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Regular files directly inside `dir` (no recursion).
pub fn get_all_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

/// A non-empty file with a jpg, jpeg or png extension.
pub fn is_valid_image(path: &Path) -> bool {
    let ext_valid = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
    let size_valid = fs::metadata(path).is_ok_and(|metadata| metadata.len() != 0);
    ext_valid && size_valid
}

/// Images to classify for a `predict` source, sorted by path. A file is
/// returned as is so that decode errors surface for it.
pub fn collect_images(source: &Path) -> io::Result<Vec<PathBuf>> {
    if !source.is_dir() {
        return Ok(vec![source.to_path_buf()]);
    }
    let mut images: Vec<PathBuf> = get_all_files(source)?
        .into_iter()
        .filter(|path| is_valid_image(path))
        .collect();
    images.sort();
    Ok(images)
}
