use super::KernelSignature;
use crate::device::StencilElem;

const INDENT: &str = "    ";

/// Incremental writer for OpenCL C kernel source.
///
/// Keeps track of block nesting so callers only say *what* to emit:
///
/// ```
/// use stencil_rs::codegen::{KernelSignature, Param, ParamKind, SourceGenerator};
///
/// let sig = KernelSignature::new(vec![
///     Param::new("n", ParamKind::Size),
///     Param::new("y", ParamKind::Global),
/// ]);
/// let mut src = SourceGenerator::new::<f32>();
/// src.kernel("fill", &sig);
/// src.grid_stride_loop("idx", "n");
/// src.line("y[idx] = 1;");
/// src.close();
/// src.close();
/// let text = src.finish();
/// assert!(text.contains("kernel void fill(ulong n, global float * restrict y)"));
/// ```
#[derive(Debug, Clone)]
pub struct SourceGenerator {
    src: String,
    depth: usize,
    elem: &'static str,
}

impl SourceGenerator {
    /// Starts a translation unit for elements of type `T`.
    pub fn new<T: StencilElem>() -> Self {
        let mut src = String::new();
        if T::TYPE_NAME == "double" {
            src.push_str("#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n");
        }
        Self {
            src,
            depth: 0,
            elem: T::TYPE_NAME,
        }
    }

    /// Element type name used in declarations.
    pub fn elem(&self) -> &'static str {
        self.elem
    }

    /// Opens a helper function.
    pub fn function(&mut self, ret: &str, name: &str, params: &KernelSignature) -> &mut Self {
        let header = format!("{} {}({})", ret, name, params.declarations(self.elem));
        self.open(&header)
    }

    /// Opens a kernel entry point.
    pub fn kernel(&mut self, name: &str, params: &KernelSignature) -> &mut Self {
        let header = format!("kernel void {}({})", name, params.declarations(self.elem));
        self.open(&header)
    }

    /// Emits a single line at the current depth.
    pub fn line(&mut self, line: &str) -> &mut Self {
        for _ in 0..self.depth {
            self.src.push_str(INDENT);
        }
        self.src.push_str(line.trim_end());
        self.src.push('\n');
        self
    }

    /// Emits a multi-line snippet, dedented to the current depth.
    ///
    /// Leading and trailing blank lines are dropped and the common leading
    /// whitespace of the remaining lines is removed, so snippets can be
    /// written as indented raw strings.
    pub fn block(&mut self, block: &str) -> &mut Self {
        let mut lines: Vec<&str> = block.split('\n').collect();
        if matches!(lines.first(), Some(line) if line.trim().is_empty()) {
            lines.remove(0);
        }
        if matches!(lines.last(), Some(line) if line.trim().is_empty()) {
            lines.pop();
        }

        let min_indent = lines
            .iter()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.chars().take_while(|c| *c == ' ' || *c == '\t').count())
            .min()
            .unwrap_or(0);

        for line in lines {
            if line.trim().is_empty() {
                self.src.push('\n');
            } else {
                let stripped: String = line.chars().skip(min_indent).collect();
                self.line(&stripped);
            }
        }
        self
    }

    /// Emits `header {` and enters the block.
    pub fn open(&mut self, header: &str) -> &mut Self {
        self.line(header);
        self.line("{");
        self.depth += 1;
        self
    }

    /// Leaves the innermost block.
    pub fn close(&mut self) -> &mut Self {
        self.depth = self.depth.saturating_sub(1);
        self.line("}");
        self
    }

    /// Opens a loop over `[0, bound)` in which each work item visits every
    /// `get_global_size(0)`-th index starting at its global id.
    pub fn grid_stride_loop(&mut self, var: &str, bound: &str) -> &mut Self {
        let header = format!(
            "for(ulong {var} = get_global_id(0); {var} < {bound}; {var} += get_global_size(0))"
        );
        self.open(&header)
    }

    /// Synchronises the work items of a group on local memory.
    pub fn barrier(&mut self) -> &mut Self {
        self.line("barrier(CLK_LOCAL_MEM_FENCE);")
    }

    pub fn finish(self) -> String {
        self.src
    }
}
