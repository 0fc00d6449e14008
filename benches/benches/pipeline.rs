use benches::{terraform_file, CLOUDFRONT_TF, WEAK_TLS_QUERY};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use engine::{CompiledQuery, QueryBody, QueryMetadata};
use model::Severity;
use std::path::Path;

fn weak_tls_query() -> CompiledQuery {
    let body: QueryBody = serde_yaml::from_str(WEAK_TLS_QUERY).expect("query body");
    let metadata = QueryMetadata {
        id: "bench-weak-tls".into(),
        query_name: "cloudfront_weak_minimum_protocol".into(),
        severity: Severity::High,
        category: "Insecure Configurations".into(),
        description_text: String::new(),
        description_url: String::new(),
        platform: "terraform".into(),
    };
    CompiledQuery::compile(metadata, body).expect("compile query")
}

fn bench_parse(c: &mut Criterion) {
    let parser = parsers::Parser::new();
    c.bench_function("parse_terraform", |b| {
        b.iter(|| parser.parse(Path::new("cloudfront.tf"), black_box(CLOUDFRONT_TF)))
    });
}

fn bench_eval(c: &mut Criterion) {
    let query = weak_tls_query();
    let file = terraform_file("cloudfront.tf", CLOUDFRONT_TF);
    c.bench_function("eval_query", |b| {
        b.iter(|| engine::eval::eval(black_box(&query), black_box(&file)))
    });
}

fn bench_detect(c: &mut Criterion) {
    let file = terraform_file("cloudfront.tf", CLOUDFRONT_TF);
    let key = "resource.aws_cloudfront_distribution.cdn.viewer_certificate.minimum_protocol_version";
    c.bench_function("detect_line", |b| {
        b.iter(|| detector::detect_line(black_box(&file), black_box(key), 3))
    });
}

criterion_group!(benches, bench_parse, bench_eval, bench_detect);
criterion_main!(benches);
