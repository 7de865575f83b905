/// One addressable row of a matrix: a stable key (held by the matrix),
/// labels, and an export flag. The index aligns the instance with every
/// metric's value vector and is maintained by the matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    index: usize,
    labels: Vec<(String, String)>,
    exportable: bool,
}

impl Instance {
    pub(crate) fn new(index: usize) -> Self {
        Instance {
            index,
            labels: Vec::new(),
            exportable: true,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    /// Sets a label, replacing any existing value. Insertion order is
    /// preserved for rendering.
    pub fn set_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.labels.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.labels.push((name, value)),
        }
    }

    pub fn get_label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }
}
