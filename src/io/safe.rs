use crate::types::{PipelineError, PipelineResult};
use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Sentinel-2 L1C SAFE product name in the post-November-2016 compact format
///
/// `MMM_MSIXXX_YYYYMMDDTHHMMSS_Nxxyy_ROOO_Txxxxx_<Product Discriminator>.SAFE`
#[derive(Debug, Clone, PartialEq)]
pub struct SafeName {
    pub mission: String,
    pub sensor: String,
    pub sensing_date: NaiveDate,
    pub relative_orbit: String,
    pub tile: String,
}

impl SafeName {
    pub fn parse(name: &str) -> PipelineResult<Self> {
        let file_name = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(name);
        let pattern = Regex::new(
            r"^(S2[A-D])_(MSI[A-Z0-9]{3})_(\d{8})T\d{6}_(N\d{4})_(R\d{3})_(T[0-9A-Z]{5})_\d{8}T\d{6}(\.SAFE)?$",
        )
        .map_err(|e| PipelineError::Processing(format!("invalid SAFE pattern: {}", e)))?;

        let caps = pattern.captures(file_name).ok_or_else(|| {
            PipelineError::MissingInput(format!("{} is not a Sentinel-2 SAFE product name", file_name))
        })?;

        let sensing_date = NaiveDate::parse_from_str(&caps[3], "%Y%m%d").map_err(|e| {
            PipelineError::MissingInput(format!("invalid sensing date in {}: {}", file_name, e))
        })?;

        Ok(Self {
            mission: caps[1].to_string(),
            sensor: caps[2].to_string(),
            sensing_date,
            relative_orbit: caps[5].to_string(),
            tile: caps[6].to_string(),
        })
    }

    /// Folder name shared by the corrected, masked and classified outputs of a product
    pub fn short_name(&self, sensing_time: &DateTime<Utc>) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.mission,
            &self.sensor[..3],
            self.sensing_date.format("%Y_%m_%d"),
            sensing_time.format("%H_%M_%S"),
            self.tile
        )
    }
}

/// Redundant products published before November 2016
pub fn is_old_format(name: &str) -> bool {
    name.split('_').nth(1) == Some("OPER")
}

/// Split product names by a substring filter; an empty filter keeps everything
pub fn filter_products(names: &[String], filter: &str) -> (Vec<String>, Vec<String>) {
    if filter.is_empty() {
        return (names.to_vec(), Vec::new());
    }
    names.iter().cloned().partition(|n| n.contains(filter))
}

/// Granule metadata file inside a SAFE folder
pub fn granule_metadata_path(safe_dir: &Path) -> PipelineResult<PathBuf> {
    let granule = safe_dir.join("GRANULE");
    let entries = std::fs::read_dir(&granule).map_err(|e| {
        PipelineError::MissingInput(format!("{}: {}", granule.display(), e))
    })?;
    for entry in entries {
        let candidate = entry?.path().join("MTD_TL.xml");
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(PipelineError::MissingInput(format!(
        "no GRANULE/*/MTD_TL.xml in {}",
        safe_dir.display()
    )))
}

/// First SENSING_TIME element of a granule metadata document
pub fn parse_sensing_time(xml: &str) -> PipelineResult<DateTime<Utc>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"SENSING_TIME" => inside = true,
            Event::Text(t) if inside => {
                let text = t.unescape()?;
                return DateTime::parse_from_rfc3339(text.trim())
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| {
                        PipelineError::MissingInput(format!("invalid SENSING_TIME '{}': {}", text, e))
                    });
            }
            Event::End(_) => inside = false,
            Event::Eof => break,
            _ => {}
        }
    }
    Err(PipelineError::MissingInput("SENSING_TIME not found".to_string()))
}

/// Short name of a downloaded SAFE product, using the granule sensing time
pub fn product_short_name(safe_dir: &Path) -> PipelineResult<String> {
    let name = SafeName::parse(&safe_dir.to_string_lossy())?;
    let xml = std::fs::read_to_string(granule_metadata_path(safe_dir)?)?;
    let sensing_time = parse_sensing_time(&xml)?;
    Ok(name.short_name(&sensing_time))
}
