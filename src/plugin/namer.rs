/// Prefix of generated interface names
pub const IFNAME_PREFIX: &str = "net";

/// Hands out `net0`, `net1`, ... for non-master delegates.
///
/// Lives for one invocation only and is never persisted.
#[derive(Debug, Default)]
pub struct InterfaceNamer {
    next: usize,
}

impl InterfaceNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_name(&mut self) -> String {
        let name = format!("{}{}", IFNAME_PREFIX, self.next);
        self.next += 1;
        name
    }
}

impl Iterator for InterfaceNamer {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        Some(self.next_name())
    }
}
