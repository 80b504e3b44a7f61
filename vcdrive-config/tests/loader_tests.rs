use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use vcdrive_config::ConfigLoader;
use vcdrive_core::DriverError;

/// Test fixture holding a temporary directory for config files
struct LoaderFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl LoaderFixture {
    fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("vcdrive.yaml");
        Ok(Self {
            _temp_dir: temp_dir,
            config_path,
        })
    }

    fn write(&self, contents: &str) -> Result<()> {
        fs::write(&self.config_path, contents)?;
        Ok(())
    }
}

#[test]
fn loads_from_an_explicit_path() -> Result<()> {
    let fixture = LoaderFixture::new()?;
    fixture.write(
        r#"
vcenter:
  host: vcenter.lab.example
  username: admin@vsphere.local
  password: secret
timeouts:
  ip_wait_secs: 60
"#,
    )?;

    let config = ConfigLoader::new().load(Some(&fixture.config_path))?;
    assert_eq!(config.vcenter.host, "vcenter.lab.example");
    assert_eq!(config.timeouts.ip_wait_secs, 60);
    Ok(())
}

#[test]
fn missing_explicit_path_names_the_file() -> Result<()> {
    let fixture = LoaderFixture::new()?;
    let missing = fixture.config_path.with_file_name("nope.yaml");

    let err = ConfigLoader::new().load(Some(&missing)).unwrap_err();
    assert!(matches!(err, DriverError::Config(_)));
    assert!(err.to_string().contains("nope.yaml"));
    Ok(())
}

#[test]
fn parse_failure_names_the_file() -> Result<()> {
    let fixture = LoaderFixture::new()?;
    fixture.write("vcenter: [this is not a mapping]")?;

    let err = ConfigLoader::new()
        .load(Some(&fixture.config_path))
        .unwrap_err();
    assert!(matches!(err, DriverError::Config(_)));
    assert!(err.to_string().contains("vcdrive.yaml"));
    Ok(())
}
