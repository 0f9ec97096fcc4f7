use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// One member of a deterministic tarball.
#[derive(Debug, Clone)]
pub struct Member {
    pub bytes: Vec<u8>,
    pub executable: bool,
}

/// Write members as a deterministic `.tar.gz`: entries sorted by name,
/// `uid=gid=0`, `mtime=0`, mode 0644 (0755 when executable). Identical
/// members always produce identical bytes.
pub fn write_deterministic_tgz(members: &BTreeMap<String, Member>) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, member) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(member.bytes.len() as u64);
        header.set_mode(if member.executable { 0o755 } else { 0o644 });
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, name, member.bytes.as_slice())
            .with_context(|| format!("failed to append {name}"))?;
    }
    let encoder = builder.into_inner().context("failed to finish tar")?;
    let bytes = encoder.finish().context("failed to finish gzip")?;
    Ok(bytes)
}

/// Read every member of a `.tar.gz` into memory.
pub fn read_tgz(bytes: &[u8]) -> Result<BTreeMap<String, Member>> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut members = BTreeMap::new();
    for entry in archive.entries().context("failed to read tar entries")? {
        let mut entry = entry.context("failed to read tar entry")?;
        let name = entry
            .path()
            .context("tar entry has no path")?
            .to_string_lossy()
            .to_string();
        let executable = entry.header().mode().map(|m| m & 0o111 != 0).unwrap_or(false);
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to read tar entry {name}"))?;
        members.insert(name, Member { bytes, executable });
    }
    Ok(members)
}

/// Extract members under a root directory, refusing path traversal.
pub fn extract_members(members: &BTreeMap<String, Member>, root: &Path) -> Result<()> {
    for (name, member) in members {
        let rel = Path::new(name);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("tar member {name} escapes the extraction root");
        }
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = std::fs::File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        file.write_all(&member.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        #[cfg(unix)]
        if member.executable {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .with_context(|| format!("failed to chmod {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(text: &str) -> Member {
        Member {
            bytes: text.as_bytes().to_vec(),
            executable: false,
        }
    }

    #[test]
    fn tgz_roundtrips_members() {
        let mut members = BTreeMap::new();
        members.insert("b.txt".to_string(), member("bee"));
        members.insert("a/nested.txt".to_string(), member("nested"));
        let bytes = write_deterministic_tgz(&members).expect("write");
        let read = read_tgz(&bytes).expect("read");
        assert_eq!(read.len(), 2);
        assert_eq!(read["b.txt"].bytes, b"bee");
        assert_eq!(read["a/nested.txt"].bytes, b"nested");
    }

    #[test]
    fn identical_inputs_produce_identical_bytes() {
        let mut members = BTreeMap::new();
        members.insert("x".to_string(), member("1"));
        members.insert("y".to_string(), member("2"));
        let a = write_deterministic_tgz(&members).expect("write");
        let b = write_deterministic_tgz(&members).expect("write");
        assert_eq!(a, b);
    }

    #[test]
    fn extraction_refuses_traversal() {
        let mut members = BTreeMap::new();
        members.insert("../escape".to_string(), member("nope"));
        let td = tempfile::tempdir().expect("tempdir");
        let err = extract_members(&members, td.path()).expect_err("must fail");
        assert!(format!("{err:#}").contains("escapes the extraction root"));
    }

    #[test]
    fn extraction_writes_nested_files() {
        let mut members = BTreeMap::new();
        members.insert("deep/dir/file.yaml".to_string(), member("data"));
        let td = tempfile::tempdir().expect("tempdir");
        extract_members(&members, td.path()).expect("extract");
        let content = std::fs::read_to_string(td.path().join("deep/dir/file.yaml"))
            .expect("read");
        assert_eq!(content, "data");
    }
}
