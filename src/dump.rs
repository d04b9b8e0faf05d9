//! JSON snapshots of the shadow heap, for debugging a replay after the fact.

use std::io::{self, BufRead, Write};

use nanoserde::{DeJson, SerJson};

use crate::{
    interval::Address,
    interval_tree::{Forest, Span},
    object::{ObjectKey, ObjectKind},
    shadow::parse_number,
    storage::Storage,
};

#[derive(Debug, Clone, PartialEq, SerJson, DeJson)]
pub struct RegionSnapshot {
    pub id: String,
    pub left: String,
    pub right: String,
    pub size: usize,
    pub forest: String,
    pub location: String,
    pub key: Option<String>,
    pub type_name: Option<String>,
    pub is_array: bool,
    pub marked: bool,
    pub flushed: bool,
    pub fully_concrete: bool,
    /// Concreteness cells, MSB = lowest byte of the cell.
    pub concreteness: String,
}

impl RegionSnapshot {
    pub fn bounds(&self) -> Option<(Address, Address)> {
        let left = parse_number(&self.left)? as Address;
        let right = parse_number(&self.right)? as Address;
        Some((left, right))
    }
}

#[derive(Debug, Clone, PartialEq, SerJson, DeJson)]
pub struct HeapDump {
    pub label: String,
    pub regions: Vec<RegionSnapshot>,
}

fn forest_name(forest: Option<Forest>) -> &'static str {
    match forest {
        Some(Forest::Root) => "root",
        Some(Forest::Marked) => "marked",
        Some(Forest::UnhandledByGc) => "unhandled",
        None => "detached",
    }
}

impl Storage {
    pub fn dump(&self, label: &str) -> HeapDump {
        let regions = self
            .iter()
            .map(|(id, object)| {
                let interval = object.interval();
                let location = object.location();
                let key = match location.key {
                    ObjectKey::None => None,
                    ObjectKey::Stack { frame, index } => Some(format!("{}:{}", frame, index)),
                    ObjectKey::StaticField(field) => Some(field.to_string()),
                };
                let type_name = (location.kind == ObjectKind::ReferenceType
                    && !object.type_name().is_empty())
                .then(|| String::from_utf8_lossy(object.type_name()).into_owned());
                RegionSnapshot {
                    id: id.to_string(),
                    left: format!("{:#x}", interval.left),
                    right: format!("{:#x}", interval.right),
                    size: object.size(),
                    forest: forest_name(self.forest_of(id)).to_string(),
                    location: location.kind.name().to_string(),
                    key,
                    type_name,
                    is_array: object.is_array(),
                    marked: interval.is_marked(),
                    flushed: interval.is_flushed(),
                    fully_concrete: object.is_fully_concrete(),
                    concreteness: object
                        .concreteness()
                        .cells()
                        .iter()
                        .map(|cell| format!("{:02x}", cell))
                        .collect(),
                }
            })
            .collect();
        HeapDump {
            label: label.to_string(),
            regions,
        }
    }
}

impl HeapDump {
    pub fn save(&self, path: &str) -> io::Result<()> {
        std::fs::write(path, self.serialize_json())
    }

    pub fn load(path: &str) -> io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        HeapDump::deserialize_json(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    fn in_forest<'a>(&'a self, forest: &'a str) -> impl Iterator<Item = &'a RegionSnapshot> {
        self.regions.iter().filter(move |region| region.forest == forest)
    }

    pub fn print_summary(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "=== Shadow Heap Dump: {} ===", self.label)?;
        writeln!(out, "Regions: {}", self.regions.len())?;
        for forest in ["root", "marked", "unhandled"] {
            writeln!(out, "  {}: {}", forest, self.in_forest(forest).count())?;
        }
        let symbolic = self.regions.iter().filter(|r| !r.fully_concrete).count();
        writeln!(out, "Partially symbolic: {}", symbolic)
    }

    pub fn find_containing(&self, address: Address) -> Option<(&RegionSnapshot, usize)> {
        self.regions.iter().find_map(|region| {
            let (left, right) = region.bounds()?;
            (left <= address && address <= right).then(|| (region, address - left))
        })
    }

    fn print_region(out: &mut impl Write, region: &RegionSnapshot) -> io::Result<()> {
        write!(
            out,
            "  {} [{} .. {}] size={} {} {}",
            region.id, region.left, region.right, region.size, region.forest, region.location
        )?;
        if let Some(key) = &region.key {
            write!(out, " key={}", key)?;
        }
        if let Some(type_name) = &region.type_name {
            write!(out, " type={}", type_name)?;
        }
        if region.is_array {
            write!(out, " array")?;
        }
        if !region.fully_concrete {
            write!(out, " symbolic={}", region.concreteness)?;
        }
        writeln!(out)
    }

    /// Line-oriented explorer over a loaded dump.
    pub fn explore(&self, input: impl BufRead, out: &mut impl Write) -> io::Result<()> {
        self.print_summary(out)?;
        writeln!(out)?;
        writeln!(out, "Commands:")?;
        writeln!(out, "  summary              - Print summary")?;
        writeln!(out, "  list [forest]        - List regions, optionally of one forest")?;
        writeln!(out, "  symbolic             - List partially symbolic regions")?;
        writeln!(out, "  containing <addr>    - Find region containing address")?;
        writeln!(out, "  quit                 - Exit")?;

        for line in input.lines() {
            let line = line?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            let Some(&command) = parts.first() else {
                continue;
            };
            match command {
                "quit" | "q" | "exit" => break,
                "summary" => self.print_summary(out)?,
                "list" => {
                    for region in &self.regions {
                        if parts.get(1).is_none_or(|forest| region.forest == *forest) {
                            Self::print_region(out, region)?;
                        }
                    }
                }
                "symbolic" => {
                    for region in self.regions.iter().filter(|r| !r.fully_concrete) {
                        Self::print_region(out, region)?;
                    }
                }
                "containing" => match parts.get(1).and_then(|text| parse_number(text)) {
                    Some(address) => match self.find_containing(address as Address) {
                        Some((region, offset)) => {
                            writeln!(out, "offset {} in", offset)?;
                            Self::print_region(out, region)?;
                        }
                        None => writeln!(out, "No region contains {:#x}", address)?,
                    },
                    None => writeln!(out, "Usage: containing <addr>")?,
                },
                other => writeln!(out, "Unknown command: {}", other)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{LocalObject, ObjectLocation};

    fn sample() -> Storage {
        let mut storage = Storage::with_options(&crate::shadow::ShadowOptions {
            seed: Some(9),
            validate: false,
        });
        storage
            .allocate_object(0x1000, 16, b"Node".to_vec(), false)
            .unwrap();
        storage.write_concreteness(0x1004, 4, false).unwrap();
        let mut local = LocalObject::addressed(0x7f00, 8, ObjectLocation::local(1, 2));
        storage.allocate_local(&mut local).unwrap();
        storage
    }

    #[test]
    fn test_dump_describes_regions() {
        let dump = sample().dump("after-write");
        assert_eq!(dump.regions.len(), 2);

        let (node, offset) = dump.find_containing(0x100c).unwrap();
        assert_eq!(offset, 0xc);
        assert_eq!(node.forest, "root");
        assert_eq!(node.type_name.as_deref(), Some("Node"));
        assert!(!node.fully_concrete);
        assert_eq!(node.concreteness, "f0ff");

        let (local, _) = dump.find_containing(0x7f00).unwrap();
        assert_eq!(local.forest, "unhandled");
        assert_eq!(local.location, "local");
        assert_eq!(local.key.as_deref(), Some("1:2"));
        assert!(dump.find_containing(0x2000).is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let dump = sample().dump("json");
        let parsed = HeapDump::deserialize_json(&dump.serialize_json()).unwrap();
        assert_eq!(parsed, dump);
    }

    #[test]
    fn test_explore_commands() {
        let dump = sample().dump("explore");
        let input = b"containing 0x7f04\nlist unhandled\nbogus\nquit\nsummary\n";
        let mut out = Vec::new();
        dump.explore(&input[..], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("offset 4 in"));
        assert!(text.contains("key=1:2"));
        assert!(text.contains("Unknown command: bogus"));
        // nothing after quit runs, so the summary is printed only once
        assert_eq!(text.matches("=== Shadow Heap Dump").count(), 1);
    }
}
