use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use sylvan::link::{InnerPredictor, LinkFunction, LinkFunctionEvaluator, LinkPoint};
use sylvan::quadrature::{GaussHermiteRule, QuadratureMarginalizer};

fn benchmark_rule_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("gauss_hermite_rule");
    for order in [5_usize, 10, 15, 30] {
        group.bench_with_input(BenchmarkId::new("golub_welsch", order), &order, |b, &n| {
            b.iter(|| {
                let rule = GaussHermiteRule::new(black_box(n)).unwrap();
                black_box(rule);
            });
        });
    }
    group.finish();
}

fn benchmark_nested_marginalization(c: &mut Criterion) {
    let evaluator = LinkFunctionEvaluator::new(
        LinkFunction::CLogLog,
        InnerPredictor::EventInteraction { indicator: 1.0 },
    );
    let point = LinkPoint::new(-2.0, 0.5, 0.0);

    let mut group = c.benchmark_group("nested_marginalization");
    for order in [5_usize, 10, 15] {
        let quadrature = QuadratureMarginalizer::new(order).unwrap();
        group.throughput(Throughput::Elements((order * order) as u64));
        group.bench_with_input(BenchmarkId::new("cloglog_harvest", order), &quadrature, |b, quad| {
            b.iter(|| {
                let p = quad.expectation(0.0, 0.5, |u_plot| {
                    let shifted = LinkPoint {
                        fixed_part: point.fixed_part + u_plot,
                        ..point
                    };
                    evaluator.marginal_value(black_box(&shifted), 0.7, quad)
                });
                black_box(p);
            });
        });
    }
    group.finish();
}

criterion_group!(
    quadrature_benchmark,
    benchmark_rule_construction,
    benchmark_nested_marginalization
);
criterion_main!(quadrature_benchmark);
