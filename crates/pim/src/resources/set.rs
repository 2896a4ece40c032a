///Ring of per-frame copies of a resource. Frame `n` works on copy `n % len`, so with one copy per frame in flight the
/// CPU never writes a copy the GPU might still read.
#[derive(Debug)]
pub struct FrameSet<T> {
    items: Vec<T>,
}

impl<T> FrameSet<T> {
    ///Creates `count` copies through `create`. Copies created before a failure are dropped again.
    pub fn try_new<E>(
        count: u32,
        mut create: impl FnMut(u32) -> Result<T, E>,
    ) -> Result<Self, E> {
        assert!(count > 0, "frame set needs at least one copy");
        let items = (0..count).map(|i| create(i)).collect::<Result<Vec<_>, _>>()?;
        Ok(FrameSet { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn slot(&self, frame: u32) -> usize {
        frame as usize % self.items.len()
    }

    pub fn current(&self, frame: u32) -> &T {
        &self.items[self.slot(frame)]
    }

    pub fn current_mut(&mut self, frame: u32) -> &mut T {
        let slot = self.slot(frame);
        &mut self.items[slot]
    }

    ///Copy used by the previous frame.
    pub fn prev(&self, frame: u32) -> &T {
        &self.items[self.slot(frame.wrapping_add(self.items.len() as u32 - 1))]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_and_prev_rotate() {
        let set = FrameSet::try_new(3, |i| Ok::<_, ()>(i)).unwrap();
        assert_eq!(*set.current(0), 0);
        assert_eq!(*set.prev(0), 2);
        assert_eq!(*set.current(4), 1);
        assert_eq!(*set.prev(4), 0);
    }

    #[test]
    fn failure_aborts_creation() {
        let mut created = 0;
        let res = FrameSet::try_new(3, |i| {
            if i == 2 {
                Err("out of memory")
            } else {
                created += 1;
                Ok(i)
            }
        });
        assert_eq!(res.unwrap_err(), "out of memory");
        assert_eq!(created, 2);
    }
}
