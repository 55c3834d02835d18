use alloc::vec::Vec;

/// Probe-length statistics of a set, computed on demand from its current
/// layout.
///
/// The probe length of a key is the number of slots between its ideal bucket
/// and the slot it actually occupies, so a key in its ideal bucket has probe
/// length zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeStats {
    /// Number of keys in the set.
    pub len: usize,
    /// Number of slots in the set.
    pub capacity: usize,
    /// Longest probe length of any key.
    pub max_probe_length: usize,
    /// Number of keys not stored in their ideal bucket.
    pub collisions: usize,
    /// `histogram[n]` is the number of keys with probe length `n`.
    pub histogram: Vec<usize>,
}

impl ProbeStats {
    pub(crate) fn from_probe_lengths(
        len: usize,
        capacity: usize,
        lengths: impl IntoIterator<Item = usize>,
    ) -> Self {
        let mut histogram = Vec::new();
        for length in lengths {
            if histogram.len() <= length {
                histogram.resize(length + 1, 0);
            }
            histogram[length] += 1;
        }

        ProbeStats {
            len,
            capacity,
            max_probe_length: histogram.len().saturating_sub(1),
            collisions: len - histogram.first().copied().unwrap_or(0),
            histogram,
        }
    }

    /// Average probe length over all keys.
    pub fn mean_probe_length(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        let total: usize = self
            .histogram
            .iter()
            .enumerate()
            .map(|(length, count)| length * count)
            .sum();
        total as f64 / self.len as f64
    }

    /// Pretty-prints the statistics and a horizontal probe-length bar chart.
    #[cfg(feature = "std")]
    pub fn print(&self) {
        println!("=== Probe Statistics ===");
        println!(
            "Population: {}/{} ({:.2}% load factor)",
            self.len,
            self.capacity,
            if self.capacity == 0 {
                0.0
            } else {
                self.len as f64 / self.capacity as f64 * 100.0
            }
        );
        println!(
            "Collisions: {} (max probe {}, mean {:.3})",
            self.collisions,
            self.max_probe_length,
            self.mean_probe_length()
        );

        let max = self.histogram.iter().copied().max().unwrap_or(0);
        if max == 0 {
            println!("probe histogram: empty");
            return;
        }

        let max_bar = 60usize;
        let total_units = max_bar * 8;
        let make_bar = |count: usize| -> std::string::String {
            if count == 0 {
                return std::string::String::new();
            }
            let units = ((count as u128 * total_units as u128).div_ceil(max as u128)) as usize;
            let mut bar = "█".repeat(units / 8);
            let partial = ['▏', '▎', '▍', '▌', '▋', '▊', '▉'];
            if units % 8 > 0 {
                bar.push(partial[units % 8 - 1]);
            }
            bar
        };

        for (length, &count) in self.histogram.iter().enumerate() {
            println!("{:>3} | {} ({})", length, make_bar(count), count);
        }
    }
}
