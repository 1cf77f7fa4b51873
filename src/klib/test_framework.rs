//! Framework de testes do kernel.
//!
//! Os testes rodam dentro do próprio kernel (feature `self_test`), depois
//! que PMM/VMM sobem e antes do scheduler assumir as CPUs. Cada subsistema
//! exporta um array de `TestCase` e `kernel_main` despacha as suites.

/// Resultado de teste
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    Passed,
    Failed,
    Skipped,
}

/// Um caso de teste
pub struct TestCase {
    pub name: &'static str,
    pub func: fn() -> TestResult,
}

impl TestCase {
    pub const fn new(name: &'static str, func: fn() -> TestResult) -> Self {
        Self { name, func }
    }
}

/// Executa uma suite de testes e devolve (passed, failed, skipped).
pub fn run_test_suite(name: &str, tests: &[TestCase]) -> (usize, usize, usize) {
    crate::kinfo!("(Test) === Suite: {} ===", name);

    let mut passed = 0;
    let mut failed = 0;
    let mut skipped = 0;

    for test in tests {
        match (test.func)() {
            TestResult::Passed => {
                crate::kinfo!("(Test) [PASS] {}", test.name);
                passed += 1;
            }
            TestResult::Failed => {
                crate::kerror!("(Test) [FAIL] {}", test.name);
                failed += 1;
            }
            TestResult::Skipped => {
                crate::kwarn!("(Test) [SKIP] {}", test.name);
                skipped += 1;
            }
        }
    }

    crate::kinfo!(
        "(Test) Suite {} terminou: {} pass, {} fail, {} skip",
        name,
        passed,
        failed,
        skipped
    );
    (passed, failed, skipped)
}
