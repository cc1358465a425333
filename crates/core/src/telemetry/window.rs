/// Fixed-capacity window over the most recent latency samples, oldest
/// overwritten first.
#[derive(Clone, Debug)]
pub struct LatencyWindow {
    buf: Vec<f64>,
    head: usize,
    len: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0.0; capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, ms: f64) {
        let cap = self.capacity();
        if self.len < cap {
            self.buf[(self.head + self.len) % cap] = ms;
            self.len += 1;
        } else {
            self.buf[self.head] = ms;
            self.head = (self.head + 1) % cap;
        }
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        let cap = self.capacity();
        (0..self.len).map(move |i| self.buf[(self.head + i) % cap])
    }

    pub fn latest(&self) -> Option<f64> {
        self.len
            .checked_sub(1)
            .map(|last| self.buf[(self.head + last) % self.capacity()])
    }

    pub fn max(&self) -> Option<f64> {
        self.iter().reduce(f64::max)
    }

    pub fn mean(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(self.iter().sum::<f64>() / self.len as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_overwrites_oldest() {
        let mut w = LatencyWindow::new(3);
        assert!(w.is_empty());
        assert_eq!(w.latest(), None);

        w.push(1.0);
        w.push(2.0);
        w.push(3.0);
        assert_eq!(w.iter().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);

        w.push(10.0);
        assert_eq!(w.len(), 3);
        assert_eq!(w.iter().collect::<Vec<_>>(), vec![2.0, 3.0, 10.0]);
        assert_eq!(w.latest(), Some(10.0));
        assert_eq!(w.max(), Some(10.0));
        assert_eq!(w.mean(), Some(5.0));
    }
}
