//! Candidate selection for the next-topic vote.
//!
//! The picking rule is a pluggable `CandidateStrategy`; the exclusion
//! fallback cascade around it lives in `CandidateSelector`.

use rand::seq::index::sample;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ShowError;
use crate::state::DiscussionHistory;
use crate::topic::{Topic, TopicProvider};

/// Which step of the cascade produced the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandidateSource {
    /// Excluding the current topic and the discussed history.
    Fresh,
    /// History had to be cleared; only the current topic was excluded.
    HistoryCleared,
    /// A larger pool was fetched and filtered.
    ExpandedPool,
    /// Top two of the largest pool, exclusion ignored.
    Degraded,
}

impl CandidateSource {
    /// Whether the fallback cascade was invoked.
    pub fn is_fallback(&self) -> bool {
        !matches!(self, CandidateSource::Fresh)
    }
}

/// Exactly two distinct topics offered to chat as options 1 and 2.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    pub first: Arc<Topic>,
    pub second: Arc<Topic>,
    pub source: CandidateSource,
}

impl CandidateSet {
    /// Topic for option 1 or 2; anything other than 2 maps to option 1.
    pub fn get(&self, option: u8) -> &Arc<Topic> {
        if option == 2 { &self.second } else { &self.first }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.first.id == id || self.second.id == id
    }
}

/// Rule for picking two candidates out of an already filtered, ranked pool.
///
/// Implement this to change how the vote is framed (variety, categories,
/// randomness) without touching the exclusion cascade.
pub trait CandidateStrategy: Send + Sync {
    /// Registry name of the strategy.
    fn name(&self) -> &str;

    /// Two distinct topics from `pool`, or `None` if the pool is too small.
    fn pick(&self, pool: &[Arc<Topic>]) -> Option<(Arc<Topic>, Arc<Topic>)>;
}

/// The two highest-ranked topics.
#[derive(Debug, Clone, Default)]
pub struct TopRanked;

impl CandidateStrategy for TopRanked {
    fn name(&self) -> &str {
        "top_ranked"
    }

    fn pick(&self, pool: &[Arc<Topic>]) -> Option<(Arc<Topic>, Arc<Topic>)> {
        match pool {
            [first, second, ..] => Some((first.clone(), second.clone())),
            _ => None,
        }
    }
}

/// The top topic plus the best-ranked one from a different category.
#[derive(Debug, Clone, Default)]
pub struct DiverseCategory;

impl CandidateStrategy for DiverseCategory {
    fn name(&self) -> &str {
        "diverse_category"
    }

    fn pick(&self, pool: &[Arc<Topic>]) -> Option<(Arc<Topic>, Arc<Topic>)> {
        let (first, rest) = pool.split_first()?;
        let second = rest
            .iter()
            .find(|t| t.category != first.category)
            .or_else(|| rest.first())?;
        Some((first.clone(), second.clone()))
    }
}

/// Two random picks from the top `top_n`, keeping rank order between them.
#[derive(Debug, Clone)]
pub struct RandomVariety {
    top_n: usize,
}

impl RandomVariety {
    pub fn new(top_n: usize) -> Self {
        Self { top_n: top_n.max(2) }
    }
}

impl Default for RandomVariety {
    fn default() -> Self {
        Self::new(10)
    }
}

impl CandidateStrategy for RandomVariety {
    fn name(&self) -> &str {
        "random_variety"
    }

    fn pick(&self, pool: &[Arc<Topic>]) -> Option<(Arc<Topic>, Arc<Topic>)> {
        let window = &pool[..pool.len().min(self.top_n)];
        if window.len() < 2 {
            return None;
        }
        let mut picks = sample(&mut rand::rng(), window.len(), 2).into_vec();
        picks.sort_unstable();
        Some((window[picks[0]].clone(), window[picks[1]].clone()))
    }
}

/// Get a candidate strategy by name.
pub fn get_strategy(name: &str) -> Option<Box<dyn CandidateStrategy>> {
    match name.to_lowercase().as_str() {
        "top_ranked" => Some(Box::new(TopRanked)),
        "diverse_category" => Some(Box::new(DiverseCategory)),
        "random_variety" => Some(Box::new(RandomVariety::default())),
        _ => None,
    }
}

/// List all available strategy names.
pub fn available_strategies() -> Vec<&'static str> {
    vec!["top_ranked", "diverse_category", "random_variety"]
}

/// Runs the exclusion cascade against a topic provider.
pub struct CandidateSelector {
    provider: Arc<dyn TopicProvider>,
    strategy: Box<dyn CandidateStrategy>,
    pool_size: usize,
    expanded_pool_size: usize,
}

impl CandidateSelector {
    pub fn new(
        provider: Arc<dyn TopicProvider>,
        strategy: Box<dyn CandidateStrategy>,
        pool_size: usize,
        expanded_pool_size: usize,
    ) -> Self {
        Self {
            provider,
            strategy,
            pool_size: pool_size.max(2),
            expanded_pool_size: expanded_pool_size.max(pool_size).max(2),
        }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Highest-ranked topic to open the show with.
    pub async fn initial_topic(&self) -> Result<Arc<Topic>, ShowError> {
        let topics = self
            .provider
            .fetch_trending(5)
            .await
            .map_err(|e| ShowError::StartupFetch(e.to_string()))?;
        let topic = topics
            .into_iter()
            .next()
            .ok_or_else(|| ShowError::StartupFetch("provider returned no topics".to_string()))?;
        info!("Selected initial topic: {}", topic.question);
        Ok(topic)
    }

    /// Two distinct candidates, following the cascade until it succeeds:
    /// exclude current + history, then clear history, then widen the pool,
    /// then take the top two regardless of exclusion.
    pub async fn select(
        &self,
        current: Option<&Topic>,
        history: &mut DiscussionHistory,
    ) -> Result<CandidateSet, ShowError> {
        let current_id = current.map(|t| t.id.clone());

        let mut exclude = history.ids();
        exclude.extend(current_id.clone());
        let pool = self.fetch_filtered(&exclude, self.pool_size).await;
        if let Some(set) = self.pick(&pool, CandidateSource::Fresh) {
            return Ok(set);
        }

        warn!(
            "Only {} candidate(s) after excluding {} discussed topics; clearing history",
            pool.len(),
            history.len()
        );
        history.clear();
        let exclude: Vec<String> = current_id.iter().cloned().collect();
        let pool = self.fetch_filtered(&exclude, self.pool_size).await;
        if let Some(set) = self.pick(&pool, CandidateSource::HistoryCleared) {
            return Ok(set);
        }

        warn!(
            "Still short of candidates; widening pool to {}",
            self.expanded_pool_size
        );
        let largest = self.fetch_pool(self.expanded_pool_size).await;
        let widened: Vec<Arc<Topic>> = largest
            .iter()
            .filter(|t| !exclude.contains(&t.id))
            .cloned()
            .collect();
        if let Some(set) = self.pick(&widened, CandidateSource::ExpandedPool) {
            return Ok(set);
        }

        // Last resort: rank order, current topic pushed to the back.
        let (others, current_only): (Vec<Arc<Topic>>, Vec<Arc<Topic>>) = largest
            .into_iter()
            .partition(|t| Some(&t.id) != current_id.as_ref());
        let ranked: Vec<Arc<Topic>> = others.into_iter().chain(current_only).collect();
        match ranked.as_slice() {
            [first, second, ..] => {
                warn!("Candidate selection degraded: ignoring exclusion rules");
                Ok(CandidateSet {
                    first: first.clone(),
                    second: second.clone(),
                    source: CandidateSource::Degraded,
                })
            }
            _ => Err(ShowError::InsufficientCandidates {
                found: ranked.len(),
            }),
        }
    }

    /// Replacement when the vote resolved to the topic just discussed:
    /// prefer a topic outside current + history, else anything but current,
    /// else anything at all.
    pub async fn replacement_for(
        &self,
        current: &Topic,
        history: &DiscussionHistory,
    ) -> Option<Arc<Topic>> {
        let mut exclude = history.ids();
        exclude.push(current.id.clone());
        if let Some(topic) = self.fetch_filtered(&exclude, self.pool_size).await.into_iter().next() {
            return Some(topic);
        }

        let pool = self.fetch_pool(self.expanded_pool_size).await;
        pool.iter()
            .find(|t| t.id != current.id)
            .or_else(|| pool.first())
            .cloned()
    }

    fn pick(&self, pool: &[Arc<Topic>], source: CandidateSource) -> Option<CandidateSet> {
        let (first, second) = self.strategy.pick(pool)?;
        if first.id == second.id {
            return None;
        }
        if source.is_fallback() {
            warn!("Candidates chosen via fallback step {:?}", source);
        }
        Some(CandidateSet {
            first,
            second,
            source,
        })
    }

    async fn fetch_filtered(&self, exclude: &[String], limit: usize) -> Vec<Arc<Topic>> {
        match self.provider.fetch_candidates(exclude, limit).await {
            Ok(topics) => dedup(
                topics
                    .into_iter()
                    .filter(|t| !exclude.contains(&t.id))
                    .collect(),
            ),
            Err(e) => {
                warn!("Candidate fetch failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn fetch_pool(&self, limit: usize) -> Vec<Arc<Topic>> {
        match self.provider.fetch_trending(limit).await {
            Ok(topics) => dedup(topics),
            Err(e) => {
                warn!("Topic pool fetch failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Drop repeated ids, keeping the best-ranked occurrence.
fn dedup(topics: Vec<Arc<Topic>>) -> Vec<Arc<Topic>> {
    let mut seen = HashSet::new();
    topics
        .into_iter()
        .filter(|t| seen.insert(t.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedProvider, topics};

    fn selector(provider: ScriptedProvider, pool: usize) -> CandidateSelector {
        CandidateSelector::new(Arc::new(provider), Box::new(TopRanked), pool, 50)
    }

    fn ids(set: &CandidateSet) -> (String, String) {
        (set.first.id.clone(), set.second.id.clone())
    }

    #[tokio::test]
    async fn test_excludes_current_and_history() {
        let pool = topics(&["A", "B", "C", "D"]);
        let selector = selector(ScriptedProvider::new(pool.clone()), 20);
        let mut history = DiscussionHistory::new(20);
        history.push("A");

        let set = selector.select(Some(&pool[0]), &mut history).await.unwrap();
        assert_eq!(ids(&set), ("B".to_string(), "C".to_string()));
        assert_eq!(set.source, CandidateSource::Fresh);
        assert!(!set.source.is_fallback());
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_clears_history_when_exclusion_leaves_one() {
        let pool = topics(&["A", "B", "C"]);
        let selector = selector(ScriptedProvider::new(pool.clone()), 20);
        let mut history = DiscussionHistory::new(20);
        history.push("A");
        history.push("B");

        let set = selector.select(Some(&pool[0]), &mut history).await.unwrap();
        assert_eq!(ids(&set), ("B".to_string(), "C".to_string()));
        assert_eq!(set.source, CandidateSource::HistoryCleared);
        assert!(history.is_empty());
        assert!(!set.contains("A"));
    }

    #[tokio::test]
    async fn test_widens_pool_before_degrading() {
        let pool = topics(&["A", "B", "C"]);
        // Base pool of 2 only ever sees [A, B].
        let selector = selector(ScriptedProvider::new(pool.clone()), 2);
        let mut history = DiscussionHistory::new(20);

        let set = selector.select(Some(&pool[0]), &mut history).await.unwrap();
        assert_eq!(ids(&set), ("B".to_string(), "C".to_string()));
        assert_eq!(set.source, CandidateSource::ExpandedPool);
    }

    #[tokio::test]
    async fn test_degrades_to_top_two_ignoring_exclusion() {
        let pool = topics(&["A", "B"]);
        let selector = selector(ScriptedProvider::new(pool.clone()), 20);
        let mut history = DiscussionHistory::new(20);

        let set = selector.select(Some(&pool[0]), &mut history).await.unwrap();
        assert_eq!(set.source, CandidateSource::Degraded);
        assert!(set.source.is_fallback());
        assert_eq!(ids(&set), ("B".to_string(), "A".to_string()));
    }

    #[tokio::test]
    async fn test_never_returns_single_candidate() {
        let pool = topics(&["A"]);
        let selector = selector(ScriptedProvider::new(pool.clone()), 20);
        let mut history = DiscussionHistory::new(20);

        let err = selector.select(Some(&pool[0]), &mut history).await.unwrap_err();
        assert!(matches!(err, ShowError::InsufficientCandidates { found: 1 }));
    }

    #[tokio::test]
    async fn test_provider_outage_cascades_to_error() {
        let provider = Arc::new(ScriptedProvider::failing());
        let selector = CandidateSelector::new(provider.clone(), Box::new(TopRanked), 20, 50);
        let mut history = DiscussionHistory::new(20);
        let err = selector.select(None, &mut history).await.unwrap_err();
        assert!(matches!(err, ShowError::InsufficientCandidates { found: 0 }));
        // Fresh, history-cleared and widened pools each asked once.
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_replacement_prefers_undiscussed() {
        let pool = topics(&["A", "B", "C"]);
        let selector = selector(ScriptedProvider::new(pool.clone()), 20);
        let mut history = DiscussionHistory::new(20);
        history.push("B");

        let topic = selector.replacement_for(&pool[0], &history).await.unwrap();
        assert_eq!(topic.id, "C");

        history.push("C");
        let topic = selector.replacement_for(&pool[0], &history).await.unwrap();
        assert_eq!(topic.id, "B");
    }

    #[tokio::test]
    async fn test_initial_topic_is_fatal_when_empty() {
        let selector = selector(ScriptedProvider::new(Vec::new()), 20);
        assert!(matches!(
            selector.initial_topic().await,
            Err(ShowError::StartupFetch(_))
        ));
    }

    #[test]
    fn test_diverse_category_strategy() {
        let pool: Vec<Arc<Topic>> = vec![
            Arc::new(Topic::new("1", "q1").with_category("Politics")),
            Arc::new(Topic::new("2", "q2").with_category("Politics")),
            Arc::new(Topic::new("3", "q3").with_category("Sports")),
        ];
        let (first, second) = DiverseCategory.pick(&pool).unwrap();
        assert_eq!((first.id.as_str(), second.id.as_str()), ("1", "3"));

        let same: Vec<Arc<Topic>> = pool[..2].to_vec();
        let (_, second) = DiverseCategory.pick(&same).unwrap();
        assert_eq!(second.id, "2");
    }

    #[test]
    fn test_random_variety_picks_distinct_from_top_n() {
        let pool = topics(&["1", "2", "3", "4", "5", "6"]);
        let strategy = RandomVariety::new(3);
        for _ in 0..50 {
            let (a, b) = strategy.pick(&pool).unwrap();
            assert_ne!(a.id, b.id);
            assert!(["1", "2", "3"].contains(&a.id.as_str()));
            assert!(["1", "2", "3"].contains(&b.id.as_str()));
        }
        assert!(strategy.pick(&pool[..1]).is_none());
    }

    #[test]
    fn test_get_strategy() {
        for name in available_strategies() {
            assert_eq!(get_strategy(name).unwrap().name(), name);
        }
        assert!(get_strategy("coin_flip").is_none());
    }
}
