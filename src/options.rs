use rand::Rng;
use rotate_reclaim::{Collector, default_collector};

use crate::{
    comparator::Comparator,
    error::{Error, Result},
    skip_list::SkipList,
};

/// Hard upper bound on tower height.
pub const MAX_HEIGHT: usize = 32;

pub const DEFAULT_MAX_HEIGHT: usize = 20;

pub const DEFAULT_LEVEL_PROBABILITY: f64 = 0.25;

/// Validated, immutable skip list settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Options {
    pub(crate) max_height: usize,
    pub(crate) level_probability: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_height: DEFAULT_MAX_HEIGHT,
            level_probability: DEFAULT_LEVEL_PROBABILITY,
        }
    }
}

impl Options {
    pub fn max_height(&self) -> usize {
        self.max_height
    }

    pub fn level_probability(&self) -> f64 {
        self.level_probability
    }

    // [1, max_height]
    pub(crate) fn random_height(&self) -> usize {
        let mut rng = rand::rng();
        let mut height = 1;
        while height < self.max_height && rng.random_bool(self.level_probability) {
            height += 1;
        }
        height
    }
}

/// Builds a [`SkipList`]. Every setting is fixed once the list exists.
#[derive(Debug, Clone)]
pub struct SkipListBuilder<C> {
    max_height: usize,
    level_probability: f64,
    comparator: C,
    collector: Option<Collector>,
}

impl<C> SkipListBuilder<C>
where
    C: Comparator + Clone,
{
    pub fn new(comparator: C) -> Self {
        Self {
            max_height: DEFAULT_MAX_HEIGHT,
            level_probability: DEFAULT_LEVEL_PROBABILITY,
            comparator,
            collector: None,
        }
    }

    /// Tallest tower a node may get. Around `log(1/p)` of the expected number
    /// of keys is enough.
    pub fn max_height(&mut self, height: usize) -> &mut Self {
        self.max_height = height;
        self
    }

    /// Probability that a tower grows by one more level.
    pub fn level_probability(&mut self, p: f64) -> &mut Self {
        self.level_probability = p;
        self
    }

    /// Collector whose critical sections protect the list. Lists share the
    /// process-wide collector unless told otherwise.
    pub fn collector(&mut self, collector: Collector) -> &mut Self {
        self.collector = Some(collector);
        self
    }

    pub fn options(&self) -> Result<Options> {
        if !(1..=MAX_HEIGHT).contains(&self.max_height) {
            return Err(Error::InvalidOptions(format!(
                "max height must be within [1, {MAX_HEIGHT}], got {}",
                self.max_height
            )));
        }
        if !(self.level_probability > 0.0 && self.level_probability < 1.0) {
            return Err(Error::InvalidOptions(format!(
                "level probability must be within (0, 1), got {}",
                self.level_probability
            )));
        }
        Ok(Options {
            max_height: self.max_height,
            level_probability: self.level_probability,
        })
    }

    pub fn build<K, V>(&self) -> Result<SkipList<K, V, C>>
    where
        C: Comparator<Item = K>,
    {
        let options = self.options()?;
        let collector = self
            .collector
            .clone()
            .unwrap_or_else(|| default_collector().clone());
        Ok(SkipList::with_options(
            self.comparator.clone(),
            options,
            collector,
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::{comparator::prelude::*, error::Error};

    use super::{DEFAULT_LEVEL_PROBABILITY, DEFAULT_MAX_HEIGHT, MAX_HEIGHT, SkipListBuilder};

    #[test]
    fn test_defaults() {
        let options = SkipListBuilder::new(DefaultComparator::<u64>::default())
            .options()
            .unwrap();
        assert_eq!(options.max_height(), DEFAULT_MAX_HEIGHT);
        assert_eq!(options.level_probability(), DEFAULT_LEVEL_PROBABILITY);
    }

    #[test]
    fn test_rejects_bad_height() {
        let mut builder = SkipListBuilder::new(DefaultComparator::<u64>::default());
        assert!(matches!(
            builder.max_height(0).options(),
            Err(Error::InvalidOptions(_))
        ));
        assert!(matches!(
            builder.max_height(MAX_HEIGHT + 1).options(),
            Err(Error::InvalidOptions(_))
        ));
        assert!(builder.max_height(MAX_HEIGHT).options().is_ok());
    }

    #[test]
    fn test_rejects_bad_probability() {
        let mut builder = SkipListBuilder::new(DefaultComparator::<u64>::default());
        for p in [0.0, 1.0, -0.5, 2.0, f64::NAN] {
            assert!(
                matches!(
                    builder.level_probability(p).options(),
                    Err(Error::InvalidOptions(_))
                ),
                "p = {p} accepted"
            );
        }
        assert!(builder.level_probability(0.5).options().is_ok());
    }

    #[test]
    fn test_random_height_respects_bounds() {
        let options = SkipListBuilder::new(DefaultComparator::<u64>::default())
            .max_height(4)
            .level_probability(0.9)
            .options()
            .unwrap();

        let heights = (0..10_000)
            .map(|_| options.random_height())
            .collect::<Vec<_>>();
        assert!(heights.iter().all(|h| (1..=4).contains(h)));
        assert!(heights.contains(&4));
    }

    #[test]
    fn test_random_height_is_geometric() {
        let options = SkipListBuilder::new(DefaultComparator::<u64>::default())
            .level_probability(0.5)
            .options()
            .unwrap();

        const SAMPLES: usize = 100_000;
        let tall = (0..SAMPLES)
            .filter(|_| options.random_height() > 1)
            .count();
        // Expected half of the samples, with a wide margin.
        assert!((SAMPLES * 4 / 10..SAMPLES * 6 / 10).contains(&tall));
    }
}
