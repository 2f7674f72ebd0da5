//! Published-date lookup against a WMS catalog and removal of local outputs
//! that are already published.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::report::{RunReport, SkipKind};
use crate::store::remove_if_exists;

/// Dates already published per layer.
pub type LayerDates = BTreeMap<String, BTreeSet<NaiveDate>>;

const DATED_NAME: &str = r"^.*_(\d{8})\.tif$";

pub trait CatalogClient: Send + Sync {
    /// Dates published for `layer` in `workspace`. An unknown layer yields an empty set.
    fn published_dates(
        &self,
        workspace: &str,
        layer: &str,
    ) -> Result<BTreeSet<NaiveDate>, PipelineError>;
}

#[derive(Clone)]
pub struct WmsCatalogClient {
    client: Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl WmsCatalogClient {
    pub fn new(base_url: &str, credentials: Option<(String, String)>) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| PipelineError::CatalogUnavailable(err.to_string()))?;
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    pub fn capabilities_url(&self, workspace: &str) -> String {
        format!(
            "{}{workspace}/wms?service=WMS&version=1.3.0&request=GetCapabilities",
            self.base_url
        )
    }
}

impl CatalogClient for WmsCatalogClient {
    fn published_dates(
        &self,
        workspace: &str,
        layer: &str,
    ) -> Result<BTreeSet<NaiveDate>, PipelineError> {
        let url = self.capabilities_url(workspace);
        let mut request = self.client.get(&url);
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request
            .send()
            .map_err(|err| PipelineError::CatalogUnavailable(format!("{url}: {err}")))?;
        if !response.status().is_success() {
            return Err(PipelineError::CatalogUnavailable(format!(
                "{url}: status {}",
                response.status().as_u16()
            )));
        }
        let body = response
            .text()
            .map_err(|err| PipelineError::CatalogUnavailable(err.to_string()))?;
        parse_capabilities(&body, layer)
    }
}

/// Extracts the time dimension of `layer` from a WMS 1.3.0 capabilities document.
///
/// Entries of the dimension are comma separated ISO timestamps; only the date
/// part is kept. Entries that are not single dates (intervals) are ignored.
pub fn parse_capabilities(xml: &str, layer: &str) -> Result<BTreeSet<NaiveDate>, PipelineError> {
    let xml_err = |err: quick_xml::Error| PipelineError::CatalogUnavailable(err.to_string());
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    // open element names, and one (name, dimension) frame per open Layer
    let mut path: Vec<String> = Vec::new();
    let mut layers: Vec<(Option<String>, Option<String>)> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(ref e) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if tag == "Layer" {
                    layers.push((None, None));
                }
                path.push(tag);
            }
            Event::Text(ref text) => {
                let parent_is_layer = path.len() >= 2 && path[path.len() - 2] == "Layer";
                if let (true, Some(frame)) = (parent_is_layer, layers.last_mut()) {
                    let value = text.unescape().map_err(xml_err)?.to_string();
                    match path.last().map(String::as_str) {
                        Some("Name") => frame.0 = Some(value),
                        Some("Dimension") if frame.1.is_none() => frame.1 = Some(value),
                        _ => {}
                    }
                }
            }
            Event::End(ref e) => {
                path.pop();
                if e.local_name().as_ref() == b"Layer" {
                    if let Some((Some(name), dimension)) = layers.pop() {
                        let matches = name == layer
                            || name.rsplit_once(':').is_some_and(|(_, short)| short == layer);
                        if matches {
                            return Ok(dimension.map(|text| parse_dimension(&text)).unwrap_or_default());
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    debug!(layer, "layer not present in capabilities");
    Ok(BTreeSet::new())
}

fn parse_dimension(text: &str) -> BTreeSet<NaiveDate> {
    text.split(',')
        .filter_map(|entry| {
            let day = entry.trim().split('T').next()?;
            NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
        })
        .collect()
}

pub struct CatalogReconciler<'a, C: CatalogClient + ?Sized> {
    client: &'a C,
}

impl<'a, C: CatalogClient + ?Sized> CatalogReconciler<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Queries each layer once. An unreachable catalog counts as nothing
    /// published and is noted in `report`.
    pub fn layer_dates(&self, workspace: &str, layers: &[String], report: &mut RunReport) -> LayerDates {
        let mut dates = LayerDates::new();
        for layer in layers {
            let published = match self.client.published_dates(workspace, layer) {
                Ok(published) => published,
                Err(err) => {
                    warn!(layer = %layer, "catalog unavailable: {err}");
                    report.skip(layer.clone(), SkipKind::CatalogUnavailable, err.to_string());
                    BTreeSet::new()
                }
            };
            info!(layer = %layer, published = published.len(), "catalog dates");
            dates.insert(layer.clone(), published);
        }
        dates
    }
}

/// Layer names present under `output_root`: its subdirectories.
pub fn local_layers(output_root: &Path) -> Result<Vec<String>, PipelineError> {
    if !output_root.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(output_root)
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    let mut layers: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    layers.sort();
    Ok(layers)
}

/// Deletes local outputs whose date is already published in their layer.
///
/// Runs after every other stage of the run: the deletion is irreversible.
/// Every layer is scanned for non-conforming names, including layers with
/// nothing published, where nothing is deleted. Returns the number of files
/// deleted.
pub fn reconcile(
    layer_dates: &LayerDates,
    output_root: &Path,
    report: &mut RunReport,
) -> Result<usize, PipelineError> {
    let dated = Regex::new(DATED_NAME).map_err(|err| PipelineError::Config(err.to_string()))?;
    let mut deleted = 0;
    for (layer, published) in layer_dates {
        let dir = output_root.join(layer);
        if !dir.is_dir() {
            continue;
        }
        let mut files: Vec<_> = fs::read_dir(&dir)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        for path in files {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let date = dated
                .captures(name)
                .and_then(|caps| NaiveDate::parse_from_str(&caps[1], "%Y%m%d").ok());
            let Some(date) = date else {
                warn!(layer = %layer, "non-conforming file name: {name}");
                report.skip(
                    path.display().to_string(),
                    SkipKind::NonConformingName,
                    format!("{name} does not end in _YYYYMMDD.tif"),
                );
                continue;
            };
            if published.contains(&date) && remove_if_exists(&path)? {
                info!(layer = %layer, %date, "already published, removed {name}");
                report.deleted.push(path.display().to_string());
                deleted += 1;
            }
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPABILITIES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<WMS_Capabilities version="1.3.0" xmlns="http://www.opengis.net/wms">
  <Capability>
    <Layer>
      <Title>root</Title>
      <Layer queryable="1">
        <Name>TMAX</Name>
        <Dimension name="time" default="current" units="ISO8601">2024-05-01T00:00:00.000Z,2024-05-02T00:00:00.000Z</Dimension>
      </Layer>
      <Layer queryable="1">
        <Name>ws:PREC</Name>
        <Dimension name="time" units="ISO8601">2024-04-30T00:00:00Z</Dimension>
      </Layer>
      <Layer>
        <Name>SRAD</Name>
      </Layer>
    </Layer>
  </Capability>
</WMS_Capabilities>"#;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[test]
    fn reads_layer_dimension() {
        let dates = parse_capabilities(CAPABILITIES, "TMAX").unwrap();
        assert_eq!(dates, BTreeSet::from([day(1), day(2)]));
    }

    #[test]
    fn matches_prefixed_names() {
        let dates = parse_capabilities(CAPABILITIES, "PREC").unwrap();
        assert_eq!(dates.len(), 1);
    }

    #[test]
    fn missing_layer_or_dimension_is_empty() {
        assert!(parse_capabilities(CAPABILITIES, "TMIN").unwrap().is_empty());
        assert!(parse_capabilities(CAPABILITIES, "SRAD").unwrap().is_empty());
    }

    #[test]
    fn malformed_document_is_unavailable() {
        let err = parse_capabilities("<Layer><Name>TMAX</Layer>", "TMAX").unwrap_err();
        assert!(matches!(err, PipelineError::CatalogUnavailable(_)));
    }
}
