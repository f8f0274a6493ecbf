use graphdef_compiler::graph_def::GradientTarget;
use graphdef_compiler::{
    Argument, BaseUpdater, CallError, CompilationContext, CompileError, Compiler, DeviceKind,
    ExecutionOptions, ExpressionBuilder, FunctionCall, FunctionRequest, GivenValue, Givens,
    GradientMaker, GraphDef, NDArrayRuntime, OperatorDef, ParallelContext, ParallelGroup, Phase,
    RunOptions, Runtime, Updater, Variable, Workspace,
};
use ndarray::{ArrayD, IxDyn, array};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Emits one `<type>Gradient` operator per forward operator, in reverse, and
/// tags every forward operator it has seen with a `grad_pass` argument.
struct ReverseGradientMaker {
    seen_costs: Mutex<Vec<String>>,
}

impl ReverseGradientMaker {
    fn new() -> Self {
        Self {
            seen_costs: Mutex::new(vec![]),
        }
    }
}

impl GradientMaker for ReverseGradientMaker {
    fn make(
        &self,
        forward_ops: Vec<OperatorDef>,
        costs: &[String],
    ) -> anyhow::Result<(Vec<OperatorDef>, Vec<OperatorDef>)> {
        self.seen_costs.lock().unwrap().extend(costs.iter().cloned());
        let backward = forward_ops
            .iter()
            .rev()
            .map(|op| OperatorDef {
                input: op.output.iter().map(|x| format!("{x}_grad")).collect(),
                output: op.input.iter().map(|x| format!("{x}_grad")).collect(),
                name: format!("{}_grad", op.name),
                r#type: format!("{}Gradient", op.r#type),
                arg: vec![],
            })
            .collect();
        let forward = forward_ops
            .into_iter()
            .map(|mut op| {
                op.arg.push(Argument::int("grad_pass", 1));
                op
            })
            .collect();
        Ok((forward, backward))
    }
}

/// Runtime that records registrations and refuses to run anything.
#[derive(Default)]
struct RecordingRuntime {
    registered: Mutex<Vec<GraphDef>>,
    fail_registration: bool,
}

impl Runtime for RecordingRuntime {
    fn register_graph(&self, graph_def: GraphDef) -> anyhow::Result<()> {
        if self.fail_registration {
            anyhow::bail!("registration rejected for {}", graph_def.name);
        }
        self.registered.lock().unwrap().push(graph_def);
        Ok(())
    }

    fn run(
        &self,
        _graph_name: &str,
        _inputs: Vec<(String, ArrayD<f32>)>,
        _outputs: &[String],
        _options: &RunOptions,
    ) -> anyhow::Result<Vec<(String, ArrayD<f32>)>> {
        anyhow::bail!("not runnable")
    }
}

struct Setup {
    workspace: Arc<Workspace>,
    compiler: Compiler,
    builder: ExpressionBuilder,
}

fn setup() -> Setup {
    init_logging();
    let workspace = Arc::new(Workspace::new());
    let runtime = Arc::new(NDArrayRuntime::new(workspace.clone()));
    let compiler = Compiler::new(workspace.clone(), runtime)
        .with_gradient_maker(Arc::new(ReverseGradientMaker::new()));
    Setup {
        workspace,
        compiler,
        builder: ExpressionBuilder::new(),
    }
}

fn assert_topological(graph: &GraphDef, leaves: &[&str]) {
    let mut available: HashSet<String> = leaves.iter().map(|x| x.to_string()).collect();
    for op in &graph.op {
        for input in &op.input {
            assert!(available.contains(input), "{input} consumed before it is produced");
        }
        available.extend(op.output.iter().cloned());
    }
}

#[test]
fn overlapping_outputs_compile_to_unique_topological_ops() {
    let Setup { compiler, builder, .. } = setup();
    let x = Variable::new("x");
    let w = Variable::new("w");
    let h = builder.mul(&x, &w);
    let a = builder.scale(&h, 0.5);
    let b = builder.add(&h, &x);
    let c = builder.sub(&a, &b);

    let function = compiler
        .compile(FunctionRequest::new().outputs([c.clone(), b.clone(), a.clone()]))
        .unwrap();
    let graph = function.graph_def();

    assert_eq!(graph.op.len(), 4);
    let names: HashSet<_> = graph.op.iter().map(|x| x.name.as_str()).collect();
    assert_eq!(names.len(), 4);
    assert_topological(graph, &["x", "w"]);
    assert_eq!(graph.target, vec![c.name(), b.name(), a.name()]);
}

#[test]
fn repeated_compilation_is_deterministic() {
    let Setup { compiler, builder, .. } = setup();
    let x = Variable::new("x");
    let y = builder.scale(&x, 3.0);
    let z = builder.add(&y, &x);
    let t = builder.mul(&z, &y);

    let first = compiler.compile(FunctionRequest::new().outputs([t.clone(), z.clone()])).unwrap();
    let second = compiler.compile(FunctionRequest::new().outputs([t, z])).unwrap();

    assert_ne!(first.name(), second.name());
    assert_eq!(first.graph_def().op, second.graph_def().op);
}

#[test]
fn compilers_and_builders_share_the_process_counters() {
    let Setup { compiler, builder, workspace } = setup();
    assert!(Arc::ptr_eq(compiler.context(), &CompilationContext::global()));
    assert!(Arc::ptr_eq(compiler.context(), builder.context()));

    let other = Compiler::new(workspace.clone(), Arc::new(NDArrayRuntime::new(workspace)));
    let x = Variable::new("x");
    let y1 = builder.scale(&x, 2.0);
    let y2 = ExpressionBuilder::new().add(&x, &x);
    let first = compiler.compile(FunctionRequest::new().outputs([y1.clone(), y2.clone()])).unwrap();
    let second = other.compile(FunctionRequest::new().outputs([y1, y2])).unwrap();

    assert_ne!(first.name(), second.name());
    assert!(first.name().starts_with("Graph_"));
    assert_eq!(first.graph_def().op.len(), 2);
    assert_topological(first.graph_def(), &["x"]);
}

#[test]
fn outputs_and_updater_conflict_before_registration() {
    init_logging();
    let workspace = Arc::new(Workspace::new());
    let runtime = Arc::new(RecordingRuntime::default());
    let compiler = Compiler::new(workspace.clone(), runtime.clone());
    let builder = ExpressionBuilder::new();

    let x = Variable::new("x");
    let y = builder.scale(&x, 2.0);
    let mut updater = BaseUpdater::sgd(0.1, 0.0);
    updater.append(&x, &Variable::new("x_grad"), 1.0, 1.0);

    let err = compiler
        .compile(FunctionRequest::new().outputs([y]).updater(&mut updater))
        .err()
        .unwrap();
    assert!(matches!(err, CompileError::ArgumentConflict));
    assert!(runtime.registered.lock().unwrap().is_empty());
    assert_eq!(updater.prefix(), "");
}

#[test]
fn givens_replace_variable_everywhere() {
    let Setup { compiler, builder, .. } = setup();
    let a = Variable::new("a");
    let c = Variable::new("c");
    let y = builder.mul(&a, &a);
    let z = builder.add(&y, &a);
    let b = builder.scale(&c, 10.0);

    let function = compiler
        .compile(
            FunctionRequest::new()
                .inputs([c.clone()])
                .outputs([z.clone()])
                .givens(Givens::new().with(&a, &b)),
        )
        .unwrap();
    let graph = function.graph_def();

    assert!(graph.op.iter().all(|op| !op.input.iter().any(|x| x == "a")));
    assert_eq!(graph.op[0].r#type, "Scale");
    assert_topological(graph, &["c"]);

    // (10c)^2 + 10c with c = 1 -> 110
    let out = function.call([array![1.0f32].into_dyn()]).unwrap();
    assert_eq!(out[0].1, array![110.0f32].into_dyn());

    // The original expression is untouched and still compiles on its own.
    assert!(z.expressions().values().any(|op| op.input.iter().any(|x| x == "a")));
    let plain = compiler.compile(FunctionRequest::new().inputs([a]).outputs([z])).unwrap();
    let out = plain.call([array![2.0f32].into_dyn()]).unwrap();
    assert_eq!(out[0].1, array![6.0f32].into_dyn());
}

#[test]
fn givens_with_array_value() {
    let Setup { compiler, builder, .. } = setup();
    let a = Variable::new("a");
    let y = builder.scale(&a, 2.0);

    let mut givens = Givens::new();
    givens.insert(&a, GivenValue::Array(array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn()));
    let function = compiler
        .compile(FunctionRequest::new().outputs([y]).givens(givens))
        .unwrap();
    let out = function.call_with(FunctionCall::default()).unwrap();
    assert_eq!(out[0].1, array![[2.0f32, 4.0], [6.0, 8.0]].into_dyn());
}

#[test]
fn givens_for_unconsumed_variable_fail() {
    let Setup { compiler, builder, .. } = setup();
    let x = Variable::new("x");
    let y = builder.scale(&x, 2.0);
    let stray = Variable::new("stray");
    let err = compiler
        .compile(FunctionRequest::new().outputs([y]).givens(Givens::new().with(&stray, &x)))
        .err()
        .unwrap();
    assert!(matches!(err, CompileError::GivensError(_)));
    assert!(err.to_string().contains("stray"));
}

#[test]
fn gradient_requests_inject_backward_ops_and_targets() {
    init_logging();
    let workspace = Arc::new(Workspace::new());
    let runtime = Arc::new(NDArrayRuntime::new(workspace.clone()));
    let maker = Arc::new(ReverseGradientMaker::new());
    let compiler = Compiler::new(workspace, runtime).with_gradient_maker(maker.clone());
    let builder = ExpressionBuilder::new();

    let x = Variable::new("x");
    let w = Variable::new("w");
    let h = builder.mul(&x, &w);
    let mut loss = builder.scale(&h, 0.5);
    loss.request_grad(&w);
    loss.request_grad(&w);
    let mut aux = builder.identity(&h);
    aux.request_grad(&w);
    aux.request_grad(&x);

    let function = compiler
        .compile(FunctionRequest::new().outputs([loss.clone(), aux.clone()]))
        .unwrap();
    let graph = function.graph_def();

    assert_eq!(graph.op.len(), 6);
    assert!(graph.op[..3].iter().all(|op| !op.r#type.ends_with("Gradient")));
    // The forward list handed back by the maker replaces the merged one.
    assert!(graph.op[..3].iter().all(|op| op.get_arg("grad_pass").is_some()));
    assert!(graph.op[3..].iter().all(|op| op.get_arg("grad_pass").is_none()));
    assert!(loss.expressions().values().all(|op| op.get_arg("grad_pass").is_none()));
    assert!(graph.op[3..].iter().all(|op| op.r#type.ends_with("Gradient")));
    assert_eq!(
        *maker.seen_costs.lock().unwrap(),
        vec![loss.name().to_string(), aux.name().to_string()]
    );

    let targets: HashSet<(String, String)> = graph
        .g_target
        .iter()
        .map(|GradientTarget { cost, wrt }| (cost.clone(), wrt.clone()))
        .collect();
    assert_eq!(graph.g_target.len(), 3);
    assert_eq!(
        targets,
        [
            (loss.name().to_string(), "w".to_string()),
            (aux.name().to_string(), "w".to_string()),
            (aux.name().to_string(), "x".to_string()),
        ]
        .into_iter()
        .collect()
    );
    assert_eq!(graph.phase(), Some(Phase::Train));
}

#[test]
fn explicit_phase_overrides_gradient_inference() {
    let Setup { compiler, builder, .. } = setup();
    let x = Variable::new("x");
    let mut loss = builder.scale(&x, 2.0);
    loss.request_grad(&x);

    let function = compiler
        .compile(FunctionRequest::new().outputs([loss]).phase(Phase::Test))
        .unwrap();
    assert_eq!(function.graph_def().phase(), Some(Phase::Test));
}

#[test]
fn options_phase_applies_when_request_has_none() {
    let Setup { workspace, builder, .. } = setup();
    let runtime = Arc::new(NDArrayRuntime::new(workspace.clone()));
    let options = ExecutionOptions {
        phase: Some(Phase::Train),
        device: Some(DeviceKind::Cuda),
        device_index: 2,
        use_cudnn: true,
        debug_mode: true,
        share_grads: true,
        ..Default::default()
    };
    let compiler = Compiler::new(workspace, runtime).with_options(options);

    let y = builder.scale(&Variable::new("x"), 2.0);
    let function = compiler.compile(FunctionRequest::new().outputs([y])).unwrap();
    let graph = function.graph_def();
    assert_eq!(graph.phase(), Some(Phase::Train));
    assert!(graph.debug_mode);
    assert!(graph.share_grads);
    let device = graph.device_option.as_ref().unwrap();
    assert_eq!(device.device_id, 2);
    assert_eq!(device.engine, "CUDNN");
}

#[test]
fn gradients_without_maker_fail() {
    init_logging();
    let workspace = Arc::new(Workspace::new());
    let runtime = Arc::new(NDArrayRuntime::new(workspace.clone()));
    let compiler = Compiler::new(workspace, runtime);
    let x = Variable::new("x");
    let mut loss = ExpressionBuilder::new().scale(&x, 2.0);
    loss.request_grad(&x);

    let err = compiler.compile(FunctionRequest::new().outputs([loss])).err().unwrap();
    assert!(matches!(err, CompileError::GradientError(_)));
}

#[test]
fn no_gradients_means_test_phase() {
    let Setup { compiler, builder, .. } = setup();
    let y = builder.scale(&Variable::new("x"), 2.0);
    let function = compiler.compile(FunctionRequest::new().outputs([y])).unwrap();
    assert_eq!(function.graph_def().phase(), Some(Phase::Test));
    assert!(function.graph_def().g_target.is_empty());
}

#[test]
fn scale_by_two_end_to_end() {
    let Setup { compiler, builder, .. } = setup();
    let x = Variable::new("x");
    let y = builder.scale(&x, 2.0);

    let function = compiler
        .compile(FunctionRequest::new().inputs([x]).outputs([y.clone()]))
        .unwrap();
    let graph = function.graph_def();
    assert_eq!(graph.op.len(), 1);
    assert!(graph.g_target.is_empty());
    assert!(graph.u_target.is_empty());
    assert_eq!(graph.phase(), Some(Phase::Test));

    let out = function.call([ArrayD::<f32>::ones(IxDyn(&[2, 3]))]).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, y.name());
    assert_eq!(out[0].1, array![[2.0f32, 2.0, 2.0], [2.0, 2.0, 2.0]].into_dyn());

    // Re-invocable, and binds by name as well.
    let out = function
        .call_with(FunctionCall {
            named: vec![("x".to_string(), array![[0.5f32]].into_dyn())],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(out[0].1, array![[1.0f32]].into_dyn());
}

#[test]
fn leaf_values_come_from_the_workspace_when_not_bound() {
    let Setup { compiler, builder, workspace } = setup();
    let x = Variable::new("x");
    let y = builder.scale(&x, 2.0);
    workspace.insert("x", ArrayD::ones(IxDyn(&[2, 3]))).unwrap();

    let function = compiler.compile(FunctionRequest::new().outputs([y])).unwrap();
    let out = function.call_with(FunctionCall::default()).unwrap();
    assert_eq!(out[0].1, ArrayD::from_elem(IxDyn(&[2, 3]), 2.0f32));
}

#[test]
fn call_binding_errors() {
    let Setup { compiler, builder, .. } = setup();
    let x = Variable::new("x");
    let y = builder.scale(&x, 2.0);
    let function = compiler.compile(FunctionRequest::new().inputs([x]).outputs([y])).unwrap();

    let one = || array![1.0f32].into_dyn();
    assert!(matches!(
        function.call([one(), one()]),
        Err(CallError::TooManyArguments { expected: 1, got: 2 })
    ));
    assert!(matches!(
        function.call_with(FunctionCall {
            named: vec![("z".to_string(), one())],
            ..Default::default()
        }),
        Err(CallError::UnknownInput(name)) if name == "z"
    ));
    assert!(matches!(
        function.call_with(FunctionCall {
            positional: vec![one()],
            named: vec![("x".to_string(), one())],
            ..Default::default()
        }),
        Err(CallError::DuplicateArgument(_))
    ));
}

#[test]
fn update_only_graph_contains_only_update_targets() {
    let Setup { compiler, workspace, .. } = setup();
    let w = Variable::new("w");
    let w_grad = Variable::new("w_grad");
    let b = Variable::new("b");
    let b_grad = Variable::new("b_grad");

    let mut updater = BaseUpdater::sgd(0.1, 0.0).with_extra_argument("lr_mult", 100.0f32);
    updater.append(&w, &w_grad, 1.0, 1.0);
    updater.append(&b, &b_grad, 2.0, 0.0);

    let function = compiler
        .compile(FunctionRequest::new().updater(&mut updater))
        .unwrap();
    let graph = function.graph_def();

    assert!(graph.op.is_empty());
    assert!(graph.target.is_empty());
    assert_eq!(graph.u_target.len(), 2);
    assert_eq!(updater.prefix(), format!("{}_", graph.name));
    for (target, lr_mult) in graph.u_target.iter().zip([1.0f32, 2.0]) {
        assert_eq!(target.r#type, "SGDUpdate");
        assert_eq!(target.get_arg("lr_mult"), Some(&Argument::float("lr_mult", lr_mult)));
        assert_eq!(target.get_arg("domain").unwrap().s.as_deref(), Some(updater.prefix()));
        assert!(target.get_arg("slot").is_some());
    }

    workspace.insert("w", array![1.0f32, 1.0].into_dyn()).unwrap();
    workspace.insert("w_grad", array![1.0f32, 2.0].into_dyn()).unwrap();
    workspace.insert("b", array![0.0f32].into_dyn()).unwrap();
    workspace.insert("b_grad", array![1.0f32].into_dyn()).unwrap();

    let out = function
        .call_with(FunctionCall {
            options: RunOptions {
                return_outputs: false,
            },
            ..Default::default()
        })
        .unwrap();
    assert!(out.is_empty());

    let w_new: Vec<f32> = workspace.fetch("w").unwrap().iter().copied().collect();
    assert!((w_new[0] - 0.9).abs() < 1e-6);
    assert!((w_new[1] - 0.8).abs() < 1e-6);
    let b_new: Vec<f32> = workspace.fetch("b").unwrap().iter().copied().collect();
    assert!((b_new[0] + 0.2).abs() < 1e-6);
}

struct FixedGroup;

impl ParallelContext for FixedGroup {
    fn is_initialized(&self) -> bool {
        true
    }
    fn active_group(&self) -> Option<ParallelGroup> {
        Some(ParallelGroup {
            rank: 0,
            members: vec![0, 1, 2, 3],
        })
    }
    fn parallel_mode(&self) -> String {
        "NCCL".to_string()
    }
    fn create_communicator(&self, _root: i32, _members: &[i32]) -> anyhow::Result<(i64, i64)> {
        Ok((7, 9))
    }
}

#[test]
fn update_graph_under_parallel_context() {
    let Setup { workspace, .. } = setup();
    let runtime = Arc::new(NDArrayRuntime::new(workspace.clone()));
    let compiler = Compiler::new(workspace, runtime).with_parallel_context(Arc::new(FixedGroup));

    let mut updater = BaseUpdater::nesterov(0.01, 0.9);
    updater.append(&Variable::new("w"), &Variable::new("w_grad"), 1.0, 1.0);
    let function = compiler.compile(FunctionRequest::new().updater(&mut updater)).unwrap();

    let target = &function.graph_def().u_target[0];
    assert_eq!(target.get_arg("parallel_mode").unwrap().s.as_deref(), Some("NCCL"));
    assert_eq!(target.get_arg("comm").unwrap().i, Some(7));
    assert_eq!(target.get_arg("group").unwrap().i, Some(9));
    assert_eq!(target.get_arg("root").unwrap().i, Some(0));
}

#[test]
fn registration_failure_propagates() {
    init_logging();
    let workspace = Arc::new(Workspace::new());
    let runtime = Arc::new(RecordingRuntime {
        fail_registration: true,
        ..Default::default()
    });
    let compiler = Compiler::new(workspace, runtime);
    let err = compiler.compile(FunctionRequest::new()).err().unwrap();
    assert!(matches!(err, CompileError::Registration(_)));
    assert!(err.to_string().starts_with("registration rejected for Graph_"));
}

#[test]
fn registered_graph_survives_wire_encoding() {
    init_logging();
    let workspace = Arc::new(Workspace::new());
    let runtime = Arc::new(RecordingRuntime::default());
    let compiler = Compiler::new(workspace, runtime.clone())
        .with_gradient_maker(Arc::new(ReverseGradientMaker::new()));
    let builder = ExpressionBuilder::new();

    let x = Variable::new("x");
    let mut loss = builder.scale(&x, 2.0).with_extra_target("x_stats");
    loss.request_grad(&x);
    compiler.compile(FunctionRequest::new().outputs([loss])).unwrap();

    let registered = runtime.registered.lock().unwrap();
    let graph = &registered[0];
    let decoded = GraphDef::from_bytes(&graph.to_bytes()).unwrap();
    assert_eq!(&decoded, graph);
    let json = serde_json::to_string(graph).unwrap();
    let from_json: GraphDef = serde_json::from_str(&json).unwrap();
    assert_eq!(&from_json, graph);
}
