/// A fallible pull iterator. `Ok(None)` signals exhaustion; every error is
/// surfaced to the caller instead of being swallowed mid-stream.
pub trait TryIterator {
    type Item;
    type Error;

    fn try_next(&mut self) -> Result<Option<Self::Item>, Self::Error>;
}

impl<I: TryIterator + ?Sized> TryIterator for Box<I> {
    type Item = I::Item;
    type Error = I::Error;

    fn try_next(&mut self) -> Result<Option<Self::Item>, Self::Error> {
        (**self).try_next()
    }
}

/// Chains a list of iterators, draining each in order.
pub struct TryIterators<ITR> {
    itrs: Vec<ITR>,
    i: usize,
}

impl<ITR> TryIterators<ITR> {
    pub fn new(itrs: Vec<ITR>) -> Self {
        Self { itrs, i: 0 }
    }
}

impl<ITR: TryIterator> TryIterator for TryIterators<ITR> {
    type Item = ITR::Item;
    type Error = ITR::Error;

    fn try_next(&mut self) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.i >= self.itrs.len() {
                return Ok(None);
            }

            let itr = &mut self.itrs[self.i];
            if let Some(v) = itr.try_next()? {
                return Ok(Some(v));
            }

            self.i += 1;
        }
    }
}
