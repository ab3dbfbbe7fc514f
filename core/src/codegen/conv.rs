//! Convolution kernel programs.
//!
//! All three kernels share the `read_x` helper, which implements the boundary
//! policy of a partition: local elements inside, halo elements next to a
//! neighbour (zero beyond the transferred window), clamped edge elements at
//! the ends of the global vector.

use super::{ConvBody, KernelProgram, KernelSignature, Param, ParamKind, SourceGenerator, Strategy};
use crate::device::StencilElem;
use crate::operator::StencilOperator;

pub const GENERIC_KERNEL: &str = "slow_conv";
pub const TILED_KERNEL: &str = "fast_conv";
pub const OPERATOR_KERNEL: &str = "stencil_convolve";

const READ_X_BODY: &str = r#"
    if (g_id >= 0 && g_id < n)
    {
        return xloc[g_id];
    }
    else if (g_id < 0)
    {
        if (has_left) return (lhalo + g_id >= 0) ? xrem[lhalo + g_id] : 0;
        else return xloc[0];
    }
    else
    {
        if (has_right) return (g_id < n + rhalo) ? xrem[lhalo + g_id - n] : 0;
        else return xloc[n - 1];
    }
"#;

/// Cooperative load of `block_size + lhalo + rhalo` inputs into `X`.
const LOAD_TILE: &str = r#"
    for(int i = l_id, j = g_id - lhalo; i < block_size + lhalo + rhalo; i += block_size, j += block_size)
    {
        X[i] = read_x(j, n, has_left, has_right, lhalo, rhalo, xloc, xrem);
    }
"#;

const STORE: &str = r#"
    if (alpha) y[g_id] = alpha * y[g_id] + beta * sum;
    else y[g_id] = beta * sum;
"#;

fn read_x_signature() -> KernelSignature {
    KernelSignature::new(vec![
        Param::new("g_id", ParamKind::Offset),
        Param::new("n", ParamKind::Size),
        Param::new("has_left", ParamKind::Flag),
        Param::new("has_right", ParamKind::Flag),
        Param::new("lhalo", ParamKind::Int),
        Param::new("rhalo", ParamKind::Int),
        Param::new("xloc", ParamKind::GlobalConst),
        Param::new("xrem", ParamKind::GlobalConst),
    ])
}

/// Launch signature shared by the convolution kernels.
///
/// `coeffs` adds the coefficient vector `s`; `locals` are the local memory
/// tiles appended after `beta`.
fn conv_signature(coeffs: bool, locals: &[&'static str]) -> KernelSignature {
    let mut params = vec![
        Param::new("n", ParamKind::Size),
        Param::new("has_left", ParamKind::Flag),
        Param::new("has_right", ParamKind::Flag),
        Param::new("lhalo", ParamKind::Int),
        Param::new("rhalo", ParamKind::Int),
    ];
    if coeffs {
        params.push(Param::new("s", ParamKind::GlobalConst));
    }
    params.extend([
        Param::new("xloc", ParamKind::GlobalConst),
        Param::new("xrem", ParamKind::GlobalConst),
        Param::new("y", ParamKind::Global),
        Param::new("alpha", ParamKind::Scalar),
        Param::new("beta", ParamKind::Scalar),
    ]);
    params.extend(locals.iter().map(|&name| Param::new(name, ParamKind::Local)));
    KernelSignature::new(params)
}

/// Emits the `read_x` boundary helper.
pub fn define_read_x(src: &mut SourceGenerator) {
    let elem = src.elem();
    src.function(elem, "read_x", &read_x_signature());
    src.block(READ_X_BODY);
    src.close();
}

/// Emits the workgroup loop of a tiled kernel. `compute` writes `sum` from
/// the staged tile.
fn tiled_loop(src: &mut SourceGenerator, compute: &str) {
    src.block(
        r#"
        size_t grid_size = get_global_size(0);
        int l_id = get_local_id(0);
        int block_size = get_local_size(0);
        "#,
    );
    src.open("for(long g_id = get_global_id(0), pos = 0; pos < n; g_id += grid_size, pos += grid_size)");
    src.block(LOAD_TILE);
    src.barrier();
    src.open("if (g_id < n)");
    src.block(compute);
    src.block(STORE);
    src.close();
    src.barrier();
    src.close();
}

/// The generic strategy: every tap goes through `read_x`.
pub fn generic_program<T: StencilElem>() -> KernelProgram<T> {
    let signature = conv_signature(true, &["loc_s", "loc_x"]);
    let mut src = SourceGenerator::new::<T>();
    define_read_x(&mut src);

    src.kernel(GENERIC_KERNEL, &signature);
    src.grid_stride_loop("idx", "n");
    src.line(&format!("{} sum = 0;", T::TYPE_NAME));
    src.open("for(int j = -lhalo; j <= rhalo; j++)");
    src.line("sum += s[lhalo + j] * read_x((long)idx + j, n, has_left, has_right, lhalo, rhalo, xloc, xrem);");
    src.close();
    src.block(
        r#"
        if (alpha) y[idx] = alpha * y[idx] + beta * sum;
        else y[idx] = beta * sum;
        "#,
    );
    src.close();
    src.close();

    KernelProgram {
        name: GENERIC_KERNEL.to_string(),
        strategy: Strategy::Generic,
        body: ConvBody::Coefficients,
        signature,
        source: src.finish(),
    }
}

/// The tiled strategy: coefficients and an input tile are staged in local
/// memory per workgroup.
pub fn tiled_program<T: StencilElem>() -> KernelProgram<T> {
    let signature = conv_signature(true, &["S", "X"]);
    let mut src = SourceGenerator::new::<T>();
    define_read_x(&mut src);

    src.kernel(TILED_KERNEL, &signature);
    tiled_loop_with_coeffs::<T>(&mut src);
    src.close();

    KernelProgram {
        name: TILED_KERNEL.to_string(),
        strategy: Strategy::Tiled,
        body: ConvBody::Coefficients,
        signature,
        source: src.finish(),
    }
}

fn tiled_loop_with_coeffs<T: StencilElem>(src: &mut SourceGenerator) {
    src.line("async_work_group_copy(S, s, lhalo + rhalo + 1, 0);");
    let compute = format!(
        r#"
        {} sum = 0;
        for(int j = -lhalo; j <= rhalo; j++)
        {{
            sum += S[lhalo + j] * X[lhalo + l_id + j];
        }}
        "#,
        T::TYPE_NAME
    );
    tiled_loop(src, &compute);
}

/// Kernel for a user operator: the tiled loop with `stencil_oper` in place of
/// the weighted sum.
pub fn operator_program<Op: StencilOperator>() -> KernelProgram<Op::Elem> {
    let signature = conv_signature(false, &["X"]);
    let elem = <Op::Elem as StencilElem>::TYPE_NAME;
    let mut src = SourceGenerator::new::<Op::Elem>();
    define_read_x(&mut src);

    let oper = KernelSignature::new(vec![Param::new("X", ParamKind::LocalConst)]);
    src.function(elem, "stencil_oper", &oper);
    src.block(Op::BODY);
    src.close();

    src.kernel(OPERATOR_KERNEL, &signature);
    tiled_loop(
        &mut src,
        &format!("{elem} sum = stencil_oper(X + lhalo + l_id);"),
    );
    src.close();

    KernelProgram {
        name: OPERATOR_KERNEL.to_string(),
        strategy: Strategy::Tiled,
        body: ConvBody::Expression {
            source: Op::BODY,
            apply: Op::apply,
        },
        signature,
        source: src.finish(),
    }
}
