use rustc_hash::FxHashMap;

/// Interns names (genomes, contigs) into dense, stable `u32` ids.
#[derive(Debug, Default, Clone)]
pub struct NameIndex {
    name_to_id: FxHashMap<String, u32>,
    id_to_name: Vec<String>,
}

impl NameIndex {
    pub fn new() -> Self {
        NameIndex {
            name_to_id: FxHashMap::default(),
            id_to_name: Vec::new(),
        }
    }

    pub fn get_or_insert_id(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.name_to_id.get(name) {
            return id;
        }
        let id = self.id_to_name.len() as u32;
        self.name_to_id.insert(name.to_owned(), id);
        self.id_to_name.push(name.to_owned());
        id
    }

    pub fn get_id(&self, name: &str) -> Option<u32> {
        self.name_to_id.get(name).copied()
    }

    pub fn get_name(&self, id: u32) -> Option<&str> {
        self.id_to_name.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.id_to_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_name.is_empty()
    }

    /// Names in id order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.id_to_name.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_dense_and_stable() {
        let mut index = NameIndex::new();
        assert_eq!(index.get_or_insert_id("chr1"), 0);
        assert_eq!(index.get_or_insert_id("chr2"), 1);
        assert_eq!(index.get_or_insert_id("chr1"), 0);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get_name(1), Some("chr2"));
        assert_eq!(index.get_id("chrX"), None);
        assert_eq!(index.names().collect::<Vec<_>>(), vec!["chr1", "chr2"]);
    }
}
