use crate::config::ConfigError;
use crate::generator::Generator;
use crate::input::Input;
use rand::Rng;
use rand_core::RngCore;
use std::fmt;
use std::sync::Arc;

/// The operation under test. Returning `Err` or unwinding out of the call is
/// an unrescued fault; anything the operation handles itself stays invisible
/// to the harness.
pub type DeployFn<I> = dyn Fn(&I) -> Result<(), anyhow::Error> + Send + Sync;

/// One generated input, tagged with the generator that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample<'a, I: Input> {
    pub generator: &'a str,
    pub data: I,
}

/// A deploy operation paired with one generator.
pub struct Test<I: Input> {
    deploy: Arc<DeployFn<I>>,
    generator: Generator<I>,
}

impl<I: Input> Test<I> {
    pub fn new(deploy: Arc<DeployFn<I>>, generator: Generator<I>) -> Self {
        Self { deploy, generator }
    }

    pub fn generator(&self) -> &Generator<I> {
        &self.generator
    }

    /// Draws one input from this test's generator.
    pub fn sample(&self, rng: &mut dyn RngCore) -> Sample<'_, I> {
        Sample {
            generator: self.generator.name(),
            data: self.generator.generate(rng),
        }
    }

    /// Runs the deploy operation on `data`. Panics are not caught here.
    pub fn deploy(&self, data: &I) -> Result<(), anyhow::Error> {
        (self.deploy)(data)
    }
}

impl<I: Input> fmt::Debug for Test<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Test")
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

/// An immutable group of tests sharing one deploy operation.
#[derive(Debug)]
pub struct TestSuite<I: Input> {
    name: String,
    tests: Vec<Test<I>>,
}

impl<I: Input> TestSuite<I> {
    pub fn builder(name: impl Into<String>) -> TestSuiteBuilder<I> {
        TestSuiteBuilder {
            name: name.into(),
            deploy: None,
            generators: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tests(&self) -> &[Test<I>] {
        &self.tests
    }

    /// Picks one test uniformly at random. Never fails: a built suite holds
    /// at least one test.
    pub fn sample(&self, rng: &mut dyn RngCore) -> &Test<I> {
        let idx = rng.random_range(0..self.tests.len());
        &self.tests[idx]
    }
}

/// Declarative construction of a [`TestSuite`].
pub struct TestSuiteBuilder<I: Input> {
    name: String,
    deploy: Option<Arc<DeployFn<I>>>,
    generators: Vec<Generator<I>>,
}

impl<I: Input> TestSuiteBuilder<I> {
    /// Registers the deploy operation. A second call replaces the first.
    pub fn deploy<F>(mut self, deploy: F) -> Self
    where
        F: Fn(&I) -> Result<(), anyhow::Error> + Send + Sync + 'static,
    {
        self.deploy = Some(Arc::new(deploy));
        self
    }

    /// Registers a named zero-argument producer.
    pub fn data<F>(self, name: impl Into<String>, producer: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
    {
        self.generator(Generator::new(name, producer))
    }

    /// Registers a named producer that draws from the worker's RNG.
    pub fn data_with_rng<F>(self, name: impl Into<String>, producer: F) -> Self
    where
        F: Fn(&mut dyn RngCore) -> I + Send + Sync + 'static,
    {
        self.generator(Generator::with_rng(name, producer))
    }

    pub fn generator(mut self, generator: Generator<I>) -> Self {
        self.generators.push(generator);
        self
    }

    pub fn build(self) -> Result<TestSuite<I>, ConfigError> {
        let deploy = self.deploy.ok_or_else(|| ConfigError::MissingDeploy {
            suite: self.name.clone(),
        })?;
        if self.generators.is_empty() {
            return Err(ConfigError::NoGenerators { suite: self.name });
        }
        let tests = self
            .generators
            .into_iter()
            .map(|generator| Test::new(Arc::clone(&deploy), generator))
            .collect();
        Ok(TestSuite {
            name: self.name,
            tests,
        })
    }
}

/// The non-empty set of suites an executor fuzzes.
#[derive(Debug)]
pub struct SuiteSet<I: Input> {
    suites: Vec<TestSuite<I>>,
}

impl<I: Input> SuiteSet<I> {
    pub fn new(suites: Vec<TestSuite<I>>) -> Result<Self, ConfigError> {
        if suites.is_empty() {
            return Err(ConfigError::NoSuites);
        }
        Ok(Self { suites })
    }

    pub fn as_slice(&self) -> &[TestSuite<I>] {
        &self.suites
    }

    pub fn len(&self) -> usize {
        self.suites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&TestSuite<I>> {
        self.suites.get(idx)
    }

    /// Picks a suite uniformly at random, returning its index.
    pub fn choose(&self, rng: &mut dyn RngCore) -> (usize, &TestSuite<I>) {
        let idx = if self.suites.len() == 1 {
            0
        } else {
            rng.random_range(0..self.suites.len())
        };
        (idx, &self.suites[idx])
    }
}

impl<I: Input> From<TestSuite<I>> for Vec<TestSuite<I>> {
    fn from(suite: TestSuite<I>) -> Self {
        vec![suite]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;

    fn echo_suite() -> TestSuite<String> {
        TestSuite::builder("suite")
            .deploy(|_data: &String| Ok(()))
            .data("1", || "a".to_string())
            .build()
            .unwrap()
    }

    #[test]
    fn build_without_deploy_fails_fast() {
        let err = TestSuite::<String>::builder("no-deploy")
            .data("1", || "a".to_string())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingDeploy { ref suite } if suite == "no-deploy"));
    }

    #[test]
    fn build_without_generators_fails_fast() {
        let err = TestSuite::<String>::builder("empty")
            .deploy(|_| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoGenerators { .. }));
    }

    #[test]
    fn each_generator_becomes_one_test() {
        let suite = TestSuite::<String>::builder("multi")
            .deploy(|_| Ok(()))
            .data("one", || "1".to_string())
            .data("two", || "2".to_string())
            .data_with_rng("three", |_rng| "3".to_string())
            .build()
            .unwrap();
        assert_eq!(suite.name(), "multi");
        let names: Vec<&str> = suite.tests().iter().map(|t| t.generator().name()).collect();
        assert_eq!(names, ["one", "two", "three"]);
    }

    #[test]
    fn single_generator_always_sampled() {
        let suite = echo_suite();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        for _ in 0..10 {
            let sample = suite.sample(&mut rng).sample(&mut rng);
            assert_eq!(sample.generator, "1");
            assert_eq!(sample.data, "a");
        }
    }

    #[test]
    fn sampling_reaches_every_test() {
        let suite = TestSuite::<String>::builder("multi")
            .deploy(|_| Ok(()))
            .data("one", || "1".to_string())
            .data("two", || "2".to_string())
            .build()
            .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let seen: HashSet<String> = (0..50)
            .map(|_| suite.sample(&mut rng).generator().name().to_string())
            .collect();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn deploy_is_shared_across_tests() {
        let suite = TestSuite::<String>::builder("fails")
            .deploy(|data: &String| Err(anyhow::anyhow!("bad {data}")))
            .data("one", || "1".to_string())
            .data("two", || "2".to_string())
            .build()
            .unwrap();
        for test in suite.tests() {
            let err = test.deploy(&"x".to_string()).unwrap_err();
            assert_eq!(err.to_string(), "bad x");
        }
    }

    #[test]
    fn suite_set_rejects_empty_list() {
        let err = SuiteSet::<String>::new(Vec::new()).unwrap_err();
        assert!(matches!(err, ConfigError::NoSuites));
    }

    #[test]
    fn single_suite_normalizes_to_list() {
        let suites: Vec<TestSuite<String>> = echo_suite().into();
        let set = SuiteSet::new(suites).unwrap();
        assert_eq!(set.len(), 1);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(set.choose(&mut rng).0, 0);
    }
}
