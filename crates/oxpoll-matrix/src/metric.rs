use oxpoll_common::error::{Error, Result};

/// How a counter is post-processed between successive samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Property {
    /// Exported verbatim, never post-processed.
    #[default]
    Raw,
    /// Current sample minus previous sample.
    Delta,
    /// Delta normalized by elapsed time.
    Rate,
    /// Delta divided by the denominator's delta.
    Average,
    /// Average scaled by 100.
    Percent,
}

impl std::str::FromStr for Property {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raw" | "" => Ok(Property::Raw),
            "delta" => Ok(Property::Delta),
            "rate" => Ok(Property::Rate),
            "average" => Ok(Property::Average),
            "percent" => Ok(Property::Percent),
            other => Err(format!("unknown counter property {other:?}")),
        }
    }
}

impl std::fmt::Display for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Property::Raw => "raw",
            Property::Delta => "delta",
            Property::Rate => "rate",
            Property::Average => "average",
            Property::Percent => "percent",
        };
        f.write_str(s)
    }
}

/// Counter metadata negotiated with the remote, keyed by metric name and
/// held separately from the metric columns. Perf collectors use it to
/// schedule post-processing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterMeta {
    pub name: String,
    pub description: String,
    pub property: Property,
    pub unit: String,
    pub denominator: Option<String>,
}

/// A named column. The value vector is aligned with the instances of the
/// owning matrix; unset cells carry a cleared record bit, never a zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    key: String,
    name: String,
    label: String,
    property: Property,
    denominator: Option<String>,
    unit: String,
    source_type: String,
    exportable: bool,
    array: bool,
    values: Vec<f64>,
    record: Vec<bool>,
}

impl Metric {
    pub(crate) fn new(key: impl Into<String>, len: usize) -> Self {
        let key = key.into();
        Metric {
            name: key.clone(),
            key,
            label: String::new(),
            property: Property::Raw,
            denominator: None,
            unit: String::new(),
            source_type: "float64".to_string(),
            exportable: true,
            array: false,
            values: vec![f64::NAN; len],
            record: vec![false; len],
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Display name used in rendered series. Defaults to the key.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Bucket label for one slot of an array counter, empty for scalars.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    pub fn property(&self) -> Property {
        self.property
    }

    pub fn set_property(&mut self, property: Property) {
        self.property = property;
    }

    pub fn denominator(&self) -> Option<&str> {
        self.denominator.as_deref()
    }

    pub fn set_denominator(&mut self, denominator: impl Into<String>) {
        self.denominator = Some(denominator.into());
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn set_unit(&mut self, unit: impl Into<String>) {
        self.unit = unit.into();
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn set_source_type(&mut self, source_type: impl Into<String>) {
        self.source_type = source_type.into();
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    pub fn is_array(&self) -> bool {
        self.array
    }

    pub fn set_array(&mut self, array: bool) {
        self.array = array;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at an instance index, `None` when the cell is unset.
    pub fn value(&self, index: usize) -> Option<f64> {
        match self.record.get(index) {
            Some(true) => Some(self.values[index]),
            _ => None,
        }
    }

    pub fn is_valid(&self, index: usize) -> bool {
        self.record.get(index).copied().unwrap_or(false)
    }

    pub(crate) fn set_value(&mut self, index: usize, value: f64) -> Result<()> {
        if index >= self.values.len() {
            return Err(Error::missing("instance index", index.to_string()));
        }
        self.values[index] = value;
        self.record[index] = true;
        Ok(())
    }

    pub(crate) fn set_value_string(&mut self, index: usize, value: &str) -> Result<()> {
        let parsed: f64 = value
            .trim()
            .parse()
            .map_err(|_| Error::parse(self.key.clone(), value))?;
        self.set_value(index, parsed)
    }

    pub(crate) fn invalidate(&mut self, index: usize) {
        if index < self.record.len() {
            self.record[index] = false;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.record.iter_mut().for_each(|r| *r = false);
    }

    pub(crate) fn clear_data(&mut self) {
        self.values.clear();
        self.record.clear();
    }

    pub(crate) fn append_slot(&mut self) {
        self.values.push(f64::NAN);
        self.record.push(false);
    }

    pub(crate) fn remove_slot(&mut self, index: usize) {
        if index < self.values.len() {
            self.values.remove(index);
            self.record.remove(index);
        }
    }

    pub(crate) fn resize(&mut self, len: usize) {
        self.values.resize(len, f64::NAN);
        self.record.resize(len, false);
    }

    pub(crate) fn values_snapshot(&self) -> (Vec<f64>, Vec<bool>) {
        (self.values.clone(), self.record.clone())
    }
}
