//! Demo model, operations and tasks used by the `modelops` binary.
//!
//! The model is a deliberately simple item-mean recommender: every item is scored with the
//! mean rating it received in training, and unknown items fall back to the global mean.
//! The other operations and tasks exist to exercise worker behavior end to end.

use crate::buffer::NumericBuffer;
use crate::error::{Error, OpError, Result};
use crate::op::{ModelOp, Registry, Task};
use crate::sharing;
use crate::sizing;
use crate::worker;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

/// Registry of everything the demo binary can run as a worker.
pub fn registry() -> Registry {
    Registry::new()
        .register_op::<ScoreItems>()
        .register_op::<ProbeWorker>()
        .register_op::<Quotient>()
        .register_task::<Add>()
        .register_task::<Divide>()
        .register_task::<ExitWith>()
        .register_task::<Abort>()
        .register_task::<Explode>()
        .register_task::<Describe>()
}

/// One observed rating.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Rating {
    pub user: u64,
    pub item: u64,
    pub rating: f64,
}

/// Read ratings from a CSV file with a `user,item,rating` header row.
///
/// Columns are matched by header name, so their order does not matter and extra columns are
/// ignored.
pub fn read_ratings(path: &Path) -> Result<Vec<Rating>> {
    let file = File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut ratings = Vec::new();
    for result in reader.deserialize() {
        let rating: Rating =
            result.map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        ratings.push(rating);
    }
    Ok(ratings)
}

/// Deterministic synthetic ratings: `users` users, each rating up to 20 of `items` items.
pub fn synthetic_ratings(users: u64, items: u64, seed: u64) -> Vec<Rating> {
    let mut ratings = Vec::new();
    if items == 0 {
        return ratings;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for user in 0..users {
        let count = rng.gen_range(1..=20);
        for _ in 0..count {
            let item = rng.gen_range(0..items);
            let rating = 1.0 + f64::from(rng.gen_range(0..9u32)) * 0.5;
            ratings.push(Rating { user, item, rating });
        }
    }
    ratings
}

/// Item-mean scoring model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMeans {
    /// Known item ids, sorted ascending.
    items: NumericBuffer<u64>,
    /// Mean rating per item, aligned with `items`.
    means: NumericBuffer<f64>,
    global_mean: f64,
}

impl ItemMeans {
    /// Train from observed ratings.
    pub fn train(ratings: &[Rating]) -> Self {
        let mut sums: BTreeMap<u64, (f64, usize)> = BTreeMap::new();
        let mut total = 0.0;
        for r in ratings {
            let entry = sums.entry(r.item).or_insert((0.0, 0));
            entry.0 += r.rating;
            entry.1 += 1;
            total += r.rating;
        }

        let global_mean = if ratings.is_empty() {
            0.0
        } else {
            total / ratings.len() as f64
        };
        let (items, means) = sums
            .into_iter()
            .map(|(item, (sum, n))| (item, sum / n as f64))
            .unzip::<_, _, Vec<_>, Vec<_>>();

        Self {
            items: items.into(),
            means: means.into(),
            global_mean,
        }
    }

    /// Number of items with a trained mean.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn global_mean(&self) -> f64 {
        self.global_mean
    }

    /// Score one item.
    pub fn score(&self, item: u64) -> f64 {
        match self.items.binary_search(&item) {
            Ok(idx) => self.means[idx],
            Err(_) => self.global_mean,
        }
    }
}

/// Items to score for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub user: u64,
    pub items: NumericBuffer<u64>,
}

impl From<(u64, Vec<u64>)> for ScoreRequest {
    fn from((user, items): (u64, Vec<u64>)) -> Self {
        Self {
            user,
            items: items.into(),
        }
    }
}

/// Scores for one user, aligned with the requested items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserScores {
    pub user: u64,
    pub scores: NumericBuffer<f64>,
}

/// Score a user's candidate items.
pub struct ScoreItems;

impl ModelOp for ScoreItems {
    const NAME: &'static str = "demo.score_items";
    type Model = ItemMeans;
    type Args = ScoreRequest;
    type Output = UserScores;

    fn apply(model: &ItemMeans, req: ScoreRequest) -> std::result::Result<UserScores, OpError> {
        let scores: Vec<f64> = req.items.par_iter().map(|&item| model.score(item)).collect();
        Ok(UserScores {
            user: req.user,
            scores: scores.into(),
        })
    }
}

/// What a worker reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProbe {
    pub pid: u32,
    /// Models fetched from handles by this process so far.
    pub fetch_count: usize,
    pub is_worker: bool,
    pub is_pooled: bool,
    pub level: usize,
    pub child_jobs: Option<usize>,
    /// `(jobs, child_jobs)` an invoker created inside this process would use.
    pub nested_jobs: (usize, usize),
    pub rayon_threads: usize,
}

impl WorkerProbe {
    fn current() -> std::result::Result<Self, OpError> {
        let ctx = worker::context();
        Ok(Self {
            pid: std::process::id(),
            fetch_count: sharing::fetch_count(),
            is_worker: worker::is_worker(),
            is_pooled: worker::is_pooled_worker(),
            level: worker::current_level(),
            child_jobs: ctx.and_then(|c| c.child_jobs),
            nested_jobs: sizing::resolve_job_counts(None)?,
            rayon_threads: rayon::current_num_threads(),
        })
    }
}

/// Report worker state; the argument is ignored.
pub struct ProbeWorker;

impl ModelOp for ProbeWorker {
    const NAME: &'static str = "demo.probe";
    type Model = ItemMeans;
    type Args = u32;
    type Output = WorkerProbe;

    fn apply(_: &ItemMeans, _: u32) -> std::result::Result<WorkerProbe, OpError> {
        WorkerProbe::current()
    }
}

/// Divide the model value by each argument.
pub struct Quotient;

impl ModelOp for Quotient {
    const NAME: &'static str = "demo.quotient";
    type Model = i64;
    type Args = i64;
    type Output = i64;

    fn apply(dividend: &i64, divisor: i64) -> std::result::Result<i64, OpError> {
        dividend.checked_div(divisor).ok_or_else(zero_division)
    }
}

fn zero_division() -> OpError {
    OpError::new("ZeroDivision", "division by zero")
}

/// Add two numbers.
pub struct Add;

impl Task for Add {
    const NAME: &'static str = "demo.add";
    type Args = (i64, i64);
    type Output = i64;

    fn run((a, b): (i64, i64)) -> std::result::Result<i64, OpError> {
        a.checked_add(b)
            .ok_or_else(|| OpError::new("Overflow", format!("{} + {} overflows", a, b)))
    }
}

/// Divide two numbers.
pub struct Divide;

impl Task for Divide {
    const NAME: &'static str = "demo.divide";
    type Args = (i64, i64);
    type Output = i64;

    fn run((a, b): (i64, i64)) -> std::result::Result<i64, OpError> {
        a.checked_div(b).ok_or_else(zero_division)
    }
}

/// Exit the process with the given status without reporting a result.
pub struct ExitWith;

impl Task for ExitWith {
    const NAME: &'static str = "demo.exit";
    type Args = i32;
    type Output = ();

    fn run(code: i32) -> std::result::Result<(), OpError> {
        std::process::exit(code)
    }
}

/// Abort the process.
pub struct Abort;

impl Task for Abort {
    const NAME: &'static str = "demo.abort";
    type Args = ();
    type Output = ();

    fn run(_: ()) -> std::result::Result<(), OpError> {
        std::process::abort()
    }
}

/// Panic with the given message.
pub struct Explode;

impl Task for Explode {
    const NAME: &'static str = "demo.explode";
    type Args = String;
    type Output = ();

    fn run(message: String) -> std::result::Result<(), OpError> {
        panic!("{}", message)
    }
}

/// Report the isolated worker's state.
pub struct Describe;

impl Task for Describe {
    const NAME: &'static str = "demo.describe";
    type Args = ();
    type Output = WorkerProbe;

    fn run(_: ()) -> std::result::Result<WorkerProbe, OpError> {
        WorkerProbe::current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn ratings() -> Vec<Rating> {
        vec![
            Rating { user: 1, item: 10, rating: 4.0 },
            Rating { user: 2, item: 10, rating: 2.0 },
            Rating { user: 1, item: 20, rating: 5.0 },
            Rating { user: 3, item: 30, rating: 1.0 },
        ]
    }

    #[test]
    fn test_item_means_training() {
        let model = ItemMeans::train(&ratings());
        assert_eq!(model.item_count(), 3);
        assert_eq!(model.score(10), 3.0);
        assert_eq!(model.score(20), 5.0);
        assert_eq!(model.score(30), 1.0);
        assert_eq!(model.global_mean(), 3.0);
    }

    #[test]
    fn test_unknown_item_gets_global_mean() {
        let model = ItemMeans::train(&ratings());
        assert_eq!(model.score(999), 3.0);

        let empty = ItemMeans::train(&[]);
        assert_eq!(empty.score(1), 0.0);
    }

    #[test]
    fn test_score_items_aligned() {
        let model = ItemMeans::train(&ratings());
        let out = ScoreItems::apply(&model, (7, vec![30, 999, 10]).into()).unwrap();
        assert_eq!(out.user, 7);
        assert_eq!(out.scores.as_slice(), &[1.0, 3.0, 3.0]);
    }

    #[test]
    fn test_quotient_and_divide() {
        assert_eq!(Quotient::apply(&12, 4).unwrap(), 3);
        assert_eq!(Quotient::apply(&12, 0).unwrap_err().kind, "ZeroDivision");
        assert_eq!(Divide::run((9, 3)).unwrap(), 3);
        assert_eq!(Divide::run((1, 0)).unwrap_err().kind, "ZeroDivision");
        assert_eq!(Add::run((2, 3)).unwrap(), 5);
        assert_eq!(Add::run((i64::MAX, 1)).unwrap_err().kind, "Overflow");
    }

    #[test]
    #[serial]
    fn test_probe_outside_worker() {
        let probe = Describe::run(()).unwrap();
        assert!(!probe.is_worker);
        assert!(!probe.is_pooled);
        assert_eq!(probe.level, 0);
        assert_eq!(probe.child_jobs, None);
    }

    #[test]
    fn test_synthetic_ratings_deterministic() {
        let a = synthetic_ratings(50, 100, 7);
        let b = synthetic_ratings(50, 100, 7);
        assert_eq!(a, b);
        assert!(a.iter().all(|r| r.item < 100 && r.user < 50));
        assert!(a.iter().all(|r| (1.0..=5.0).contains(&r.rating)));
        assert!(synthetic_ratings(5, 0, 1).is_empty());
        assert_ne!(synthetic_ratings(50, 100, 8), a);
    }

    #[test]
    fn test_read_ratings_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "user,item,rating").unwrap();
        writeln!(file, "1,10,4.5").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "2, 11, 3").unwrap();
        let ratings = read_ratings(file.path()).unwrap();
        assert_eq!(ratings.len(), 2);
        assert_eq!(ratings[1], Rating { user: 2, item: 11, rating: 3.0 });
    }

    #[test]
    fn test_read_ratings_quoted_and_reordered() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rating,user,item,timestamp").unwrap();
        writeln!(file, "\"4.5\",\"1\",\"10\",881250949").unwrap();
        writeln!(file, "2,\"3\",12,881250950").unwrap();
        let ratings = read_ratings(file.path()).unwrap();
        assert_eq!(
            ratings,
            vec![
                Rating { user: 1, item: 10, rating: 4.5 },
                Rating { user: 3, item: 12, rating: 2.0 },
            ]
        );
    }

    #[test]
    fn test_read_ratings_rejects_bad_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "user,item,rating").unwrap();
        writeln!(file, "1,10,4.5").unwrap();
        writeln!(file, "oops").unwrap();
        assert!(matches!(read_ratings(file.path()), Err(Error::Config(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "user,item,rating").unwrap();
        writeln!(file, "1,ten,4.5").unwrap();
        assert!(matches!(read_ratings(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_registry_contents() {
        let registry = registry();
        assert!(registry.has_op(ScoreItems::NAME));
        assert!(registry.has_op(ProbeWorker::NAME));
        assert!(registry.has_task(Add::NAME));
        assert!(registry.has_task(Describe::NAME));
    }
}
