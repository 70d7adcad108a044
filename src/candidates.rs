//! Parser for the acceleration-search overview XML.
//!
//! The search tool writes one `overview.xml` per run containing the
//! observation header, the search parameters, and the candidate list. The
//! fold stage needs the candidates plus just enough header to re-derive
//! barycentric periods, so this parser pulls exactly those fields and
//! ignores the rest of the (large) document.

use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::error::PipelineError;
use crate::types::Candidate;

/// The subset of an overview document the pipeline consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOverview {
    pub sample_count: u64,
    pub sampling_interval_s: f64,
    pub fft_size: u64,
    pub candidates: Vec<Candidate>,
}

/// Parse an overview file from disk.
pub async fn read_overview(path: &Path) -> Result<SearchOverview, PipelineError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        PipelineError::ExternalToolFailure(format!(
            "failed to read overview {}: {e}",
            path.display()
        ))
    })?;
    let overview = parse_overview(&text)?;
    debug!(
        file = %path.display(),
        candidates = overview.candidates.len(),
        "parsed search overview"
    );
    Ok(overview)
}

/// Parse overview XML text.
pub fn parse_overview(text: &str) -> Result<SearchOverview, PipelineError> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut sample_count: Option<u64> = None;
    let mut tsamp: Option<f64> = None;
    let mut fft_size: Option<u64> = None;
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut current: Option<PartialCandidate> = None;

    loop {
        match reader.read_event().map_err(bad_xml)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "candidate" && stack.last().map(String::as_str) == Some("candidates") {
                    current = Some(PartialCandidate::default());
                }
                stack.push(name);
            }
            Event::End(_) => {
                if stack.pop().as_deref() == Some("candidate") {
                    if let Some(partial) = current.take() {
                        candidates.push(partial.finish(candidates.len())?);
                    }
                }
            }
            Event::Text(t) => {
                let value = t.unescape().map_err(bad_xml)?;
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                let leaf = stack.last().map(String::as_str).unwrap_or("");
                let section = stack
                    .iter()
                    .rev()
                    .nth(1)
                    .map(String::as_str)
                    .unwrap_or("");
                match (section, leaf) {
                    ("header_parameters", "nsamples") => {
                        sample_count = Some(parse_num(value, "nsamples")?);
                    }
                    ("header_parameters", "tsamp") => {
                        tsamp = Some(parse_float(value, "tsamp")?);
                    }
                    ("search_parameters", "size") => {
                        fft_size = Some(parse_num(value, "size")?);
                    }
                    ("candidate", field) => {
                        if let Some(partial) = current.as_mut() {
                            partial.set(field, value)?;
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(SearchOverview {
        sample_count: sample_count
            .ok_or_else(|| missing("header_parameters/nsamples"))?,
        sampling_interval_s: tsamp.ok_or_else(|| missing("header_parameters/tsamp"))?,
        fft_size: fft_size.ok_or_else(|| missing("search_parameters/size"))?,
        candidates,
    })
}

#[derive(Debug, Default)]
struct PartialCandidate {
    period_s: Option<f64>,
    acceleration_ms2: Option<f64>,
    dm: Option<f64>,
    snr: Option<f64>,
}

impl PartialCandidate {
    fn set(&mut self, field: &str, value: &str) -> Result<(), PipelineError> {
        match field {
            "period" => self.period_s = Some(parse_float(value, "period")?),
            "acc" => self.acceleration_ms2 = Some(parse_float(value, "acc")?),
            "dm" => self.dm = Some(parse_float(value, "dm")?),
            "snr" => self.snr = Some(parse_float(value, "snr")?),
            _ => {}
        }
        Ok(())
    }

    fn finish(self, index: usize) -> Result<Candidate, PipelineError> {
        Ok(Candidate {
            index,
            period_s: self.period_s.ok_or_else(|| missing("candidate/period"))?,
            acceleration_ms2: self
                .acceleration_ms2
                .ok_or_else(|| missing("candidate/acc"))?,
            dm: self.dm.ok_or_else(|| missing("candidate/dm"))?,
            snr: self.snr.ok_or_else(|| missing("candidate/snr"))?,
        })
    }
}

fn bad_xml(e: quick_xml::Error) -> PipelineError {
    PipelineError::ExternalToolFailure(format!("malformed overview XML: {e}"))
}

fn missing(what: &str) -> PipelineError {
    PipelineError::ExternalToolFailure(format!("overview XML missing {what}"))
}

fn parse_num(value: &str, what: &str) -> Result<u64, PipelineError> {
    value.parse().map_err(|_| {
        PipelineError::ExternalToolFailure(format!("overview XML has bad {what}: {value:?}"))
    })
}

fn parse_float(value: &str, what: &str) -> Result<f64, PipelineError> {
    value.parse().map_err(|_| {
        PipelineError::ExternalToolFailure(format!("overview XML has bad {what}: {value:?}"))
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<peasoup_search>
  <header_parameters>
    <source_name>J0000+0000</source_name>
    <nsamples>4194304</nsamples>
    <tsamp>7.6e-05</tsamp>
  </header_parameters>
  <search_parameters>
    <infilename>obs.fil</infilename>
    <size>4194304</size>
  </search_parameters>
  <candidates>
    <candidate id='0'>
      <period>0.0123456</period>
      <opt_period>0.0123457</opt_period>
      <dm>42.5</dm>
      <acc>-1.25</acc>
      <snr>14.2</snr>
    </candidate>
    <candidate id='1'>
      <period>1.5</period>
      <dm>10.0</dm>
      <acc>0.0</acc>
      <snr>9.1</snr>
    </candidate>
  </candidates>
</peasoup_search>
"#;

    #[test]
    fn parses_header_and_candidates() {
        let overview = parse_overview(SAMPLE).unwrap();
        assert_eq!(overview.sample_count, 4_194_304);
        assert!((overview.sampling_interval_s - 7.6e-5).abs() < 1e-12);
        assert_eq!(overview.fft_size, 4_194_304);
        assert_eq!(overview.candidates.len(), 2);

        let first = &overview.candidates[0];
        assert_eq!(first.index, 0);
        assert!((first.period_s - 0.0123456).abs() < 1e-12);
        assert!((first.acceleration_ms2 + 1.25).abs() < 1e-12);
        assert!((first.dm - 42.5).abs() < 1e-12);
        assert!((first.snr - 14.2).abs() < 1e-12);
        assert_eq!(overview.candidates[1].index, 1);
    }

    #[test]
    fn empty_candidate_list_is_valid() {
        let text = r#"<peasoup_search>
  <header_parameters><nsamples>1024</nsamples><tsamp>1e-4</tsamp></header_parameters>
  <search_parameters><size>1024</size></search_parameters>
  <candidates></candidates>
</peasoup_search>"#;
        let overview = parse_overview(text).unwrap();
        assert!(overview.candidates.is_empty());
    }

    #[test]
    fn missing_header_field_is_rejected() {
        let text = r#"<peasoup_search>
  <header_parameters><tsamp>1e-4</tsamp></header_parameters>
  <search_parameters><size>1024</size></search_parameters>
  <candidates/>
</peasoup_search>"#;
        let err = parse_overview(text).unwrap_err();
        assert!(err.to_string().contains("nsamples"));
    }

    #[test]
    fn candidate_missing_period_is_rejected() {
        let text = r#"<peasoup_search>
  <header_parameters><nsamples>1024</nsamples><tsamp>1e-4</tsamp></header_parameters>
  <search_parameters><size>1024</size></search_parameters>
  <candidates><candidate><dm>1.0</dm><acc>0.0</acc><snr>9.0</snr></candidate></candidates>
</peasoup_search>"#;
        assert!(parse_overview(text).is_err());
    }

    #[tokio::test]
    async fn reads_overview_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("overview.xml");
        tokio::fs::write(&path, SAMPLE).await.unwrap();
        let overview = read_overview(&path).await.unwrap();
        assert_eq!(overview.candidates.len(), 2);
    }
}
