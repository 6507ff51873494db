#[macro_export]
macro_rules! fetch {
    ($method:literal, $url:expr) => {
        reqwest::blocking::Client::new().request(hyper::Method::from_bytes($method)?, $url)
    };
}

/// Reads a zip archive into `(name, content)` pairs, sorted by name.
#[allow(dead_code)]
pub fn read_zip(data: Vec<u8>) -> Vec<(String, String)> {
    use std::io::Read;
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(data)).unwrap();
    let mut files = vec![];
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        files.push((file.name().to_string(), content));
    }
    files.sort();
    files
}

/// Reads a tar stream into `(name, content)` pairs, sorted by name.
#[allow(dead_code)]
pub fn read_tar<R: std::io::Read>(reader: R) -> Vec<(String, String)> {
    use std::io::Read;
    let mut archive = tar::Archive::new(reader);
    let mut files = vec![];
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        files.push((name, content));
    }
    files.sort();
    files
}
