//! Merging of units whose template is explained by another unit's template.
//!
//! Every template is laid out alone in its own segment of a [`TemplateRecording`] and the
//! matching pursuit is asked to explain it with the other templates. A unit whose segment is
//! explained by exactly one spike of another unit, at its own position, within tight
//! amplitude bounds and with a similar shape, is a duplicate of that unit. Passes repeat on
//! the surviving units until none is merged, so the result is stable under re-application.

use std::collections::{HashMap, HashSet};
use std::result::Result;
use ndarray::{Array2, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use crate::error::{RecordingError, SortingError, invalid_parameter};
use crate::job::JobParameters;
use crate::matching::{
    TemplateMatcher, match_chunks,
    omp::{MatchingParameters, MatchingPursuit},
};
use crate::peaks::PeakLabels;
use crate::recording::{Probe, Recording};
use crate::templates::Templates;


/// Recording where segment `i` holds template `i` surrounded by zeros
pub struct TemplateRecording<'a> {
    templates: &'a Templates,
    padding: usize,
}

impl<'a> TemplateRecording<'a> {
    pub fn new(templates: &'a Templates, padding: usize) -> Self {
        TemplateRecording { templates, padding }
    }

    /// Sample of a segment where the template's peak sits
    pub fn slot(&self) -> i64 {
        (self.padding + self.templates.nbefore) as i64
    }

    fn segment_length(&self) -> usize {
        self.templates.num_samples() + 2 * self.padding
    }
}

impl<'a> Recording for TemplateRecording<'a> {
    fn sampling_frequency(&self) -> f64 {
        self.templates.sampling_frequency
    }

    fn num_channels(&self) -> usize {
        self.templates.num_channels()
    }

    fn channel_ids(&self) -> &[String] {
        &self.templates.channel_ids
    }

    fn get_probe(&self) -> &Probe {
        &self.templates.probe
    }

    fn num_segments(&self) -> usize {
        self.templates.num_units()
    }

    fn num_samples(&self, segment_index: usize) -> Result<usize, RecordingError> {
        if segment_index >= self.num_segments() {
            return Err(RecordingError::SegmentNotFound(segment_index));
        }

        Ok(self.segment_length())
    }

    fn get_traces(
        &self,
        segment_index: usize,
        start_frame: usize,
        end_frame: usize,
    ) -> Result<Array2<f32>, RecordingError> {
        let length = self.num_samples(segment_index)?;
        if start_frame > end_frame || end_frame > length {
            return Err(RecordingError::FramesOutOfBounds { segment_index, start_frame, end_frame });
        }

        let mut segment = Array2::<f32>::zeros((length, self.num_channels()));
        let mask = self.templates.get_sparsity_mask(segment_index);
        let template = self.templates.unit(segment_index);
        for (channel, active) in mask.iter().enumerate() {
            if *active {
                segment.slice_mut(s![self.padding..self.padding + template.nrows(), channel])
                    .assign(&template.column(channel));
            }
        }

        Ok(segment.slice(s![start_frame..end_frame, ..]).to_owned())
    }
}

/// Settings of [`remove_duplicates_via_matching`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicationParameters {
    /// Amplitude bounds of the matching, tight so that only near copies match
    pub matching: MatchingParameters,
    /// Minimal cosine similarity between a duplicate and the unit it is merged into
    pub similarity_threshold: f32,
    pub job: JobParameters,
}

impl Default for DeduplicationParameters {
    fn default() -> Self {
        DeduplicationParameters {
            matching: MatchingParameters { amplitude_min: 0.9, amplitude_max: 1.1 },
            similarity_threshold: 0.95,
            job: JobParameters::sequential(100.),
        }
    }
}

impl DeduplicationParameters {
    pub fn validate(&self) -> Result<(), SortingError> {
        self.matching.validate()?;
        self.job.validate()?;
        if !(-1. ..=1.).contains(&self.similarity_threshold) {
            return Err(invalid_parameter("similarity_threshold", "must be within [-1, 1]"));
        }

        Ok(())
    }
}

/// Surviving units and the relabelled peaks
#[derive(Debug, Clone)]
pub struct DeduplicationOutput {
    /// Sorted unit ids that survived
    pub labels: Vec<i64>,
    pub peak_labels: PeakLabels,
    pub templates: Templates,
    /// `(removed, kept)` unit id pairs
    pub merges: Vec<(i64, i64)>,
    pub dropped_chunks: usize,
}

fn cosine_similarity(a: ArrayView2<f32>, b: ArrayView2<f32>) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0. || norm_b == 0. {
        0.
    } else {
        dot / (norm_a * norm_b)
    }
}

/// One pass, returns the unit each duplicate is redirected to (positions in `templates`)
fn find_redirects(
    templates: &Templates,
    params: &DeduplicationParameters,
) -> Result<(HashMap<usize, usize>, usize), SortingError> {
    // non finite templates cannot explain others, their own segments fail and are dropped
    let matchable: Vec<usize> = (0..templates.num_units())
        .filter(|&unit| templates.has_finite_template(unit))
        .collect();
    if matchable.is_empty() {
        return Ok((HashMap::new(), 0));
    }
    let mut matcher_index: Vec<Option<usize>> = vec![None; templates.num_units()];
    for (index, &unit) in matchable.iter().enumerate() {
        matcher_index[unit] = Some(index);
    }

    let matcher = MatchingPursuit::new(&templates.select_units(&matchable), &params.matching)?;
    let recording = TemplateRecording::new(templates, matcher.margin());
    let slot = recording.slot();

    let output = match_chunks(&recording, &matcher, &params.job, |chunk| {
        matcher_index[chunk.segment_index].into_iter().collect()
    })?;

    let mut found: Vec<Vec<usize>> = vec![Vec::new(); templates.num_units()];
    let mut at_slot: Vec<bool> = vec![true; templates.num_units()];
    for spike in &output.spikes {
        found[spike.segment_index].push(matchable[spike.unit_index]);
        at_slot[spike.segment_index] &= spike.sample_index == slot;
    }

    let masked: Vec<Array2<f32>> = (0..templates.num_units())
        .map(|unit| {
            let mut template = templates.unit(unit).to_owned();
            for (mut channel, active) in template.axis_iter_mut(Axis(1)).zip(templates.get_sparsity_mask(unit).iter()) {
                if !active {
                    channel.fill(0.);
                }
            }

            template
        })
        .collect();

    let mut redirects: HashMap<usize, usize> = HashMap::new();
    let root_of = |redirects: &HashMap<usize, usize>, mut unit: usize| {
        while let Some(next) = redirects.get(&unit) {
            unit = *next;
        }

        unit
    };

    // sequential so that a chain of duplicates collapses onto one survivor
    for unit in 0..templates.num_units() {
        if found[unit].len() != 1 || !at_slot[unit] {
            continue;
        }

        let candidate = found[unit][0];
        if cosine_similarity(masked[unit].view(), masked[candidate].view()) < params.similarity_threshold {
            continue;
        }

        let root = root_of(&redirects, candidate);
        if root != unit {
            redirects.insert(unit, root);
        }
    }

    let resolved = redirects.keys()
        .map(|unit| (*unit, root_of(&redirects, *unit)))
        .collect();

    Ok((resolved, output.dropped_chunks))
}

/// Merges duplicate units until none is left, labels of merged units are redirected to
/// the unit that explains them and labels of units absent from `templates` become noise
pub fn remove_duplicates_via_matching(
    templates: &Templates,
    mut peak_labels: PeakLabels,
    params: &DeduplicationParameters,
) -> Result<DeduplicationOutput, SortingError> {
    params.validate()?;

    let mut current = templates.clone();
    let mut merges = Vec::new();
    let mut dropped_chunks = 0;

    while current.num_units() > 1 {
        let (redirects, dropped) = find_redirects(&current, params)?;
        dropped_chunks += dropped;

        if redirects.is_empty() {
            break;
        }

        let mapping: HashMap<i64, i64> = redirects.iter()
            .map(|(removed, kept)| (current.unit_ids[*removed], current.unit_ids[*kept]))
            .collect();
        peak_labels.relabel(&mapping);

        let mut pass_merges: Vec<(i64, i64)> = mapping.into_iter().collect();
        pass_merges.sort();
        merges.extend(pass_merges);

        let kept: Vec<usize> = (0..current.num_units())
            .filter(|unit| !redirects.contains_key(unit))
            .collect();
        current = current.select_units(&kept);
    }

    let valid: HashSet<i64> = current.unit_ids.iter().copied().collect();
    peak_labels.retain_units(&valid);

    let mut labels = current.unit_ids.clone();
    labels.sort();

    if !merges.is_empty() {
        log::info!("deduplication: merged {} units, {} remain", merges.len(), labels.len());
    }
    if dropped_chunks > 0 {
        log::warn!("deduplication: {} chunks dropped, their units were kept", dropped_chunks);
    }

    Ok(DeduplicationOutput { labels, peak_labels, templates: current, merges, dropped_chunks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn shape(scale: f32, width: f32) -> Vec<f32> {
        (0..20).map(|s| {
            let t = (s as f32 - 8.) / width;
            -scale * (-(t * t) / 2.).exp()
        }).collect()
    }

    fn templates(shapes: &[(usize, Vec<f32>)]) -> Templates {
        let mut array = Array3::<f32>::zeros((shapes.len(), 20, 3));
        for (unit, (channel, values)) in shapes.iter().enumerate() {
            for (s, value) in values.iter().enumerate() {
                array[[unit, s, *channel]] = *value;
                array[[unit, s, (*channel + 1) % 3]] = 0.3 * value;
            }
        }

        Templates {
            templates_array: array,
            sparsity_mask: None,
            unit_ids: (0..shapes.len() as i64).map(|i| i * 10).collect(),
            channel_ids: vec!["0".into(), "1".into(), "2".into()],
            nbefore: 8,
            sampling_frequency: 10000.,
            probe: Probe::linear(3, 20.),
        }
    }

    #[test]
    fn test_template_recording_layout() {
        let templates = templates(&[(0, shape(10., 2.))]);
        let recording = TemplateRecording::new(&templates, 20);

        let traces = recording.get_traces(0, 0, 60).unwrap();

        assert_eq!(recording.num_samples(0).unwrap(), 60);
        assert_eq!(traces[[recording.slot() as usize, 0]], -10.);
        assert!(traces.slice(s![..20, ..]).iter().all(|x| *x == 0.));
    }

    #[test]
    fn test_near_identical_units_merge() -> Result<(), SortingError> {
        let templates = templates(&[
            (0, shape(10., 2.)),
            (2, shape(20., 1.5)),
            (0, shape(10.2, 2.)),
        ]);
        let labels = PeakLabels::from_vec(vec![0, 10, 20, 20, -1, 30]);

        let output = remove_duplicates_via_matching(&templates, labels, &DeduplicationParameters::default())?;

        assert_eq!(output.labels.len(), 2);
        assert!(output.labels.contains(&10));
        assert_eq!(output.merges.len(), 1);

        let survivor = output.merges[0].1;
        assert_eq!(output.peak_labels.as_slice()[0], survivor);
        assert_eq!(output.peak_labels.as_slice()[2], survivor);
        assert_eq!(output.peak_labels.as_slice()[5], -1);
        assert!(output.peak_labels.is_consistent_with(&output.labels));

        Ok(())
    }

    #[test]
    fn test_deduplication_is_idempotent() -> Result<(), SortingError> {
        let templates = templates(&[
            (0, shape(10., 2.)),
            (0, shape(10.1, 2.)),
            (1, shape(9.9, 2.)),
            (2, shape(15., 3.)),
        ]);
        let labels = PeakLabels::from_vec(vec![0, 10, 20, 30, 10, 0]);
        let params = DeduplicationParameters::default();

        let first = remove_duplicates_via_matching(&templates, labels, &params)?;
        let second = remove_duplicates_via_matching(&first.templates, first.peak_labels.clone(), &params)?;

        assert!(second.merges.is_empty());
        assert_eq!(second.labels, first.labels);
        assert_eq!(second.peak_labels, first.peak_labels);

        Ok(())
    }

    #[test]
    fn test_empty_templates() -> Result<(), SortingError> {
        let templates = templates(&[]);

        let output = remove_duplicates_via_matching(&templates, PeakLabels::from_vec(vec![3, -1]), &DeduplicationParameters::default())?;

        assert!(output.labels.is_empty());
        assert_eq!(output.peak_labels.as_slice(), &[-1, -1]);

        Ok(())
    }
}
