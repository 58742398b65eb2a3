//! Micro-benchmarks for RoutingTable operations: add, closest, and remove
//! at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use did_dht::{Id, Node, RoutingTable};
use std::net::SocketAddrV4;
use std::time::Instant;

fn main() {
    println!("routing_table\n");

    bench_add();
    bench_closest();
    bench_remove();
}

fn address(i: usize) -> SocketAddrV4 {
    SocketAddrV4::new([127, 0, (i >> 8) as u8, i as u8].into(), 6881)
}

fn random_nodes(count: usize) -> Vec<Node> {
    (0..count).map(|i| Node::new(Id::random(), address(i))).collect()
}

fn bench_add() {
    println!("add");

    let nodes = random_nodes(1000);

    {
        let mut table = RoutingTable::new(Id::random());
        let start = Instant::now();
        for node in nodes.iter().cloned() {
            table.add(node);
        }
        let per_op = start.elapsed().as_nanos() / nodes.len() as u128;
        println!(
            "empty table:     {per_op}ns/op (final size: {})",
            table.size()
        );
    }

    {
        let mut table = RoutingTable::new(Id::random());
        for node in random_nodes(400) {
            table.add(node);
        }

        let start = Instant::now();
        for node in nodes.iter().cloned() {
            table.add(node);
        }
        let per_op = start.elapsed().as_nanos() / nodes.len() as u128;
        println!("full table:      {per_op}ns/op");
    }

    println!();
}

fn bench_closest() {
    println!("closest");

    let targets: Vec<_> = (0..1000).map(|_| Id::random()).collect();

    for size in [50, 100, 200, 400] {
        let mut table = RoutingTable::new(Id::random());
        for node in random_nodes(size) {
            table.add(node);
        }

        let start = Instant::now();
        for target in &targets {
            let _ = table.closest(target);
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;
        println!("{size:>3} nodes: {per_op}ns/op");
    }

    println!();
}

fn bench_remove() {
    println!("remove");

    let mut table = RoutingTable::new(Id::random());
    let nodes = random_nodes(200);
    for node in nodes.iter().cloned() {
        table.add(node);
    }

    let start = Instant::now();
    for node in &nodes {
        table.remove(node.id());
    }
    let per_op = start.elapsed().as_nanos() / nodes.len() as u128;
    println!("{per_op}ns/op ({} removals)", nodes.len());
    println!();
}
