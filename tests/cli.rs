//! End-to-end runs of the `script-host` binary.

use std::io::Write;
use std::process::{Command, Output, Stdio};

use script_host::wire::{read_value, Value, SYMBOL_EXT};

fn sym(name: &str) -> rmpv::Value {
    rmpv::Value::Ext(SYMBOL_EXT, name.as_bytes().to_vec())
}

fn envelope(sources: &[(&str, &str)]) -> Vec<u8> {
    envelope_with_input(rmpv::Value::Nil, sources)
}

fn envelope_with_input(input: rmpv::Value, sources: &[(&str, &str)]) -> Vec<u8> {
    let sources = sources
        .iter()
        .map(|(path, text)| rmpv::Value::Array(vec![(*path).into(), (*text).into()]))
        .collect();
    let job = rmpv::Value::Map(vec![
        (sym("input"), input),
        (sym("sources"), rmpv::Value::Array(sources)),
    ]);
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &job).unwrap();
    bytes
}

fn host(args: &[&str], stdin: &[u8]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_script-host"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(stdin).unwrap();
    child.wait_with_output().unwrap()
}

fn stat(records: &[(String, Value)], name: &str) -> i64 {
    find(records, "stat")[0].get(name).and_then(Value::as_int).unwrap()
}

fn records(stdout: &[u8]) -> Vec<(String, Value)> {
    let mut rd = stdout;
    let mut out = Vec::new();
    while !rd.is_empty() {
        let record = read_value(&mut rd).unwrap();
        let Value::Array(mut items) = record else {
            panic!("record is not an array: {record:?}");
        };
        let payload = items.pop().unwrap();
        let Some(Value::Symbol(tag)) = items.pop() else {
            panic!("record has no tag");
        };
        out.push((tag.as_str().to_owned(), payload));
    }
    out
}

fn find<'a>(records: &'a [(String, Value)], tag: &str) -> Vec<&'a Value> {
    records
        .iter()
        .filter(|(t, _)| t == tag)
        .map(|(_, payload)| payload)
        .collect()
}

#[test]
fn test_runs_a_job() {
    let output = host(&[], &envelope(&[("A", "output = 'x' print('hi')")]));
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let records = records(&output.stdout);
    let result = find(&records, "output");
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].get("extracted"), Some(&Value::str("x")));
    assert_eq!(result[0].get("stdout"), Some(&Value::str("hi\n")));

    let (last_tag, stat) = records.last().unwrap();
    assert_eq!(last_tag, "stat");
    let bytes_in = stat.get("bytes_in").and_then(Value::as_int).unwrap();
    assert_eq!(bytes_in, i64::try_from(envelope(&[("A", "output = 'x' print('hi')")]).len()).unwrap());
}

#[test]
fn test_measurements_in_lifecycle_order() {
    let output = host(&[], &envelope(&[("A", "a = 1")]));
    assert_eq!(output.status.code(), Some(0));
    let names: Vec<String> = find(&records(&output.stdout), "measurement")
        .into_iter()
        .map(|m| match &m.as_array().unwrap()[0] {
            Value::Symbol(name) => name.as_str().to_owned(),
            other => panic!("bad name {other:?}"),
        })
        .collect();
    assert_eq!(
        names,
        vec!["in", "mem", "init", "sandbox", "decode", "inject", "lib", "compile", "eval", "out"]
    );
}

#[test]
fn test_size_hint_and_trailing_bytes() {
    let body = envelope(&[("A", "output = 7")]);
    let mut stdin = Vec::new();
    rmp::encode::write_uint(&mut stdin, body.len() as u64).unwrap();
    stdin.extend_from_slice(&body);
    stdin.extend_from_slice(b"trailing junk");

    let output = host(&[], &stdin);
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    let records = records(&output.stdout);
    assert_eq!(find(&records, "output")[0].get("extracted"), Some(&Value::Int(7)));
}

#[test]
fn test_instruction_quota_is_fatal() {
    let output = host(&["-i", "6000"], &envelope(&[("A", "while true do end")]));
    assert_eq!(output.status.code(), Some(17));
    assert!(find(&records(&output.stdout), "stat").is_empty());
}

#[test]
fn test_memory_quota_is_fatal() {
    let script = "local t = {} for i = 1, 1e7 do t[i] = string.rep('x', 64) .. i end";
    let output = host(&["-m", "262144", "-i", "100000000"], &envelope(&[("A", script)]));
    assert_eq!(output.status.code(), Some(16));
}

#[test]
fn test_bad_capacity() {
    let output = host(&["-m", "1024"], &envelope(&[("A", "output = 1")]));
    assert_eq!(output.status.code(), Some(14));
}

#[test]
fn test_bad_input() {
    assert_eq!(host(&[], b"").status.code(), Some(2));
    assert_eq!(host(&[], &[0x93, 0x01, 0x02, 0x03]).status.code(), Some(2));
}

#[test]
fn test_unconvertible_output() {
    let output = host(&[], &envelope(&[("A", "output = print")]));
    assert_eq!(output.status.code(), Some(9));
}

#[test]
fn test_syntax_error_then_valid_unit() {
    let output = host(&[], &envelope(&[("A", "output = = 1"), ("B", "output = 2")]));
    assert_eq!(output.status.code(), Some(0));
    let records = records(&output.stdout);
    let errors = find(&records, "error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].get("__type"), Some(&Value::symbol("syntax")));
    assert_eq!(find(&records, "output")[0].get("extracted"), Some(&Value::Int(2)));
    assert_eq!(records.last().unwrap().0, "stat");
}

#[test]
fn test_large_output_after_confinement() {
    let script = "output = string.rep('x', 12 * 1024 * 1024)";
    let output = host(&["-m", "67108864"], &envelope(&[("A", script)]));
    assert_eq!(output.status.code(), Some(0), "{:?}", output.status);

    let records = records(&output.stdout);
    let Some(Value::Str(text)) = find(&records, "output")[0].get("extracted") else {
        panic!("output is not a string");
    };
    assert_eq!(text.len(), 12 * 1024 * 1024);
}

#[test]
fn test_large_input_after_confinement() {
    let input = rmpv::Value::from("i".repeat(24 * 1024 * 1024));
    let stdin = envelope_with_input(input, &[("A", "output = #input")]);
    let output = host(&["-m", "67108864"], &stdin);
    assert_eq!(output.status.code(), Some(0), "{:?}", output.status);
    assert_eq!(
        find(&records(&output.stdout), "output")[0].get("extracted"),
        Some(&Value::Int(24 * 1024 * 1024))
    );
}

#[test]
fn test_answers_while_input_stays_open() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_script-host"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(&envelope(&[("A", "output = 3")])).unwrap();
    stdin.flush().unwrap();

    let output = child.wait_with_output().unwrap();
    drop(stdin);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(find(&records(&output.stdout), "output")[0].get("extracted"), Some(&Value::Int(3)));
}

#[test]
fn test_unmetered_unit_may_exceed_quota() {
    let output = host(
        &["-i", "6000", "-C", "1"],
        &envelope(&[("A", "for i = 1, 10000 do end"), ("B", "output = 1")]),
    );
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let records = records(&output.stdout);
    assert!(find(&records, "error").is_empty());
    assert_eq!(find(&records, "output")[0].get("extracted"), Some(&Value::Int(1)));
    assert!(stat(&records, "total_instructions") > stat(&records, "instructions"));
    assert!(stat(&records, "total_instructions") > 10_000);
}

#[test]
fn test_pattern_search_is_unavailable() {
    let script = "local s = string.rep('a', 100000) output = s:find('.-.-.-b')";
    let output = host(&["-i", "6000"], &envelope(&[("A", script)]));
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let records = records(&output.stdout);
    let errors = find(&records, "error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].get("__type"), Some(&Value::symbol("runtime")));
    assert_eq!(find(&records, "output")[0].get("extracted"), Some(&Value::Nil));
}

#[test]
fn test_many_prints() {
    let script = "local line = string.rep('p', 200) for i = 1, 30000 do print(line) end";
    let started = std::time::Instant::now();
    let output = host(&["-i", "2000000", "-m", "67108864"], &envelope(&[("A", script)]));
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    let records = records(&output.stdout);
    let Some(Value::Str(text)) = find(&records, "output")[0].get("stdout") else {
        panic!("stdout is not a string");
    };
    assert_eq!(text.len(), 30_000 * 201);
}

#[test]
fn test_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_script-host"))
        .arg("-h")
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("USAGE"));
}
