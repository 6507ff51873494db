mod utils;

use fixtures::{server, Error, TestServer};
use flate2::read::GzDecoder;
use rstest::rstest;
use utils::{read_tar, read_zip};

fn root_files() -> Vec<(String, String)> {
    vec![
        ("a.txt".to_string(), "abcd".to_string()),
        ("sub/b.txt".to_string(), "0123456789".to_string()),
    ]
}

fn root_name(server: &TestServer) -> String {
    server
        .path()
        .canonicalize()
        .unwrap()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned()
}

#[rstest]
fn get_zip(server: TestServer) -> Result<(), Error> {
    let resp = reqwest::blocking::get(format!("{}?format=zip", server.url()))?;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "application/zip");
    assert_eq!(
        resp.headers().get("content-disposition").unwrap(),
        &format!("attachment; filename=\"{}.zip\"", root_name(&server))
    );
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");
    assert_eq!(resp.headers().get("pragma").unwrap(), "no-cache");
    assert_eq!(resp.headers().get("expires").unwrap(), "0");
    assert_eq!(read_zip(resp.bytes()?.to_vec()), root_files());
    Ok(())
}

#[rstest]
fn get_tar(server: TestServer) -> Result<(), Error> {
    let resp = reqwest::blocking::get(format!("{}?format=tar", server.url()))?;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "application/x-tar");
    assert_eq!(read_tar(&resp.bytes()?[..]), root_files());
    Ok(())
}

#[rstest]
fn get_tar_gz(server: TestServer) -> Result<(), Error> {
    let resp = reqwest::blocking::get(format!("{}?format=tar.gz", server.url()))?;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "application/gzip");
    let data = resp.bytes()?;
    assert_eq!(read_tar(GzDecoder::new(&data[..])), root_files());
    Ok(())
}

#[rstest]
#[case("zip")]
#[case("TAR")]
#[case("Tar.Gz")]
fn format_is_case_insensitive(server: TestServer, #[case] format: &str) -> Result<(), Error> {
    let resp = reqwest::blocking::get(format!("{}sub/?format={format}", server.url()))?;
    assert_eq!(resp.status(), 200);
    let disposition = resp.headers().get("content-disposition").unwrap().to_str()?;
    assert_eq!(
        disposition,
        format!("attachment; filename=\"sub.{}\"", format.to_lowercase())
    );
    Ok(())
}

#[rstest]
fn sub_archive_names_are_relative(server: TestServer) -> Result<(), Error> {
    let resp = reqwest::blocking::get(format!("{}sub/?format=zip", server.url()))?;
    assert_eq!(
        read_zip(resp.bytes()?.to_vec()),
        vec![("b.txt".to_string(), "0123456789".to_string())]
    );
    Ok(())
}

#[rstest]
fn unknown_format_lists(server: TestServer) -> Result<(), Error> {
    let resp = reqwest::blocking::get(format!("{}?format=rar", server.url()))?;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/html; charset=utf-8"
    );
    Ok(())
}

#[rstest]
fn archives_match_disk(server: TestServer) -> Result<(), Error> {
    std::fs::create_dir_all(server.path().join("sub/deeper"))?;
    std::fs::write(server.path().join("sub/deeper/c.txt"), "c")?;
    let resp = reqwest::blocking::get(format!("{}sub/?format=tar", server.url()))?;
    assert_eq!(
        read_tar(&resp.bytes()?[..]),
        vec![
            ("b.txt".to_string(), "0123456789".to_string()),
            ("deeper/c.txt".to_string(), "c".to_string()),
        ]
    );
    Ok(())
}
