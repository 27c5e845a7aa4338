//! System trait, parameter resolution and the function-system trampoline.
//!
//! A system is any function whose parameters implement [`SystemParam`].
//! Each parameter resolves itself against the world at call time and owns
//! a persistent state cell (query caches, event cursors, local values,
//! command buffers). After the call, parameter teardown runs in reverse
//! order, which is where command buffers flush.
//!
//! Parameter claiming is trait dispatch: a function with a non-parameter
//! argument type fails to convert at compile time.

use std::marker::PhantomData;

use crate::error::Result;
use crate::world::World;

/// A value resolvable from the world as a system function argument.
///
/// # Safety
/// `get_param` receives an aliased world pointer shared by every
/// parameter of one call. Implementations must only touch world data
/// disjoint from what sibling parameters of the same system borrow, or
/// data owned by their own `State`.
pub unsafe trait SystemParam: Sized {
    /// Persistent per-system state backing this parameter
    type State: Send + Sync + 'static;

    /// The value handed to the function, borrowing world (`'w`) and
    /// state (`'s`)
    type Item<'w, 's>;

    /// Build the state on the system's first run
    fn init_state(world: &mut World) -> Self::State;

    /// Resolve the parameter value for one call
    ///
    /// # Safety
    /// `world` must be valid for `'w` and only accessed per the trait
    /// contract above.
    unsafe fn get_param<'w, 's>(
        state: &'s mut Self::State,
        world: *mut World,
    ) -> Result<Self::Item<'w, 's>>;

    /// Teardown after the call returned; runs in reverse parameter order
    fn apply(state: &mut Self::State, world: &mut World) -> Result<()> {
        let _ = (state, world);
        Ok(())
    }
}

/// Shorthand for the resolved value of a parameter
pub type SystemParamItem<'w, 's, P> = <P as SystemParam>::Item<'w, 's>;

macro_rules! impl_system_param_tuple {
    (($($P:ident),*), ($($R:ident),*)) => {
        #[allow(non_snake_case, unused_variables, clippy::unused_unit)]
        unsafe impl<$($P: SystemParam),*> SystemParam for ($($P,)*) {
            type State = ($($P::State,)*);
            type Item<'w, 's> = ($($P::Item<'w, 's>,)*);

            fn init_state(world: &mut World) -> Self::State {
                ($($P::init_state(world),)*)
            }

            unsafe fn get_param<'w, 's>(
                state: &'s mut Self::State,
                world: *mut World,
            ) -> Result<Self::Item<'w, 's>> {
                let ($($P,)*) = state;
                Ok(($($P::get_param($P, world)?,)*))
            }

            fn apply(state: &mut Self::State, world: &mut World) -> Result<()> {
                let ($($P,)*) = state;
                // Reverse parameter order
                $($R::apply($R, world)?;)*
                Ok(())
            }
        }
    };
}

impl_system_param_tuple!((), ());
impl_system_param_tuple!((A), (A));
impl_system_param_tuple!((A, B), (B, A));
impl_system_param_tuple!((A, B, C), (C, B, A));
impl_system_param_tuple!((A, B, C, D), (D, C, B, A));
impl_system_param_tuple!((A, B, C, D, E), (E, D, C, B, A));
impl_system_param_tuple!((A, B, C, D, E, F), (F, E, D, C, B, A));
impl_system_param_tuple!((A, B, C, D, E, F, G), (G, F, E, D, C, B, A));
impl_system_param_tuple!((A, B, C, D, E, F, G, H), (H, G, F, E, D, C, B, A));

/// Type-erased system: anything the scheduler can run against a world
pub trait System: Send + Sync + 'static {
    /// Diagnostic name
    fn name(&self) -> &str;

    /// Run once; the first error aborts the surrounding stage
    fn run(&mut self, world: &mut World) -> Result<()>;
}

/// Boxed system handle stored in scheduler stages
pub type BoxedSystem = Box<dyn System>;

impl System for BoxedSystem {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&mut self, world: &mut World) -> Result<()> {
        (**self).run(world)
    }
}

/// Return types accepted from system functions
pub trait IntoSystemResult {
    fn into_system_result(self) -> Result<()>;
}

impl IntoSystemResult for () {
    fn into_system_result(self) -> Result<()> {
        Ok(())
    }
}

impl IntoSystemResult for Result<()> {
    fn into_system_result(self) -> Result<()> {
        self
    }
}

/// Wrapper for the piped-in first argument of a receiving system.
/// See [`pipe`].
pub struct In<T>(pub T);

/// A function callable with resolved system parameters.
///
/// Implemented for plain functions `fn(p0..pn) -> Out` and for piped
/// receivers `fn(In<I>, p0..pn) -> Out`, up to eight parameters.
pub trait SystemParamFunction<Marker>: Send + Sync + 'static {
    /// Piped input (`()` for plain systems)
    type In;
    type Out;
    type Param: SystemParam;

    fn run(&mut self, input: Self::In, param: SystemParamItem<Self::Param>) -> Self::Out;
}

macro_rules! impl_system_function {
    ($($P:ident),*) => {
        #[allow(non_snake_case)]
        impl<Out, Func, $($P: SystemParam),*> SystemParamFunction<fn($($P,)*) -> Out> for Func
        where
            Func: Send + Sync + 'static,
            // The function must accept both the declared parameter types
            // (elided lifetimes) and the resolved items (world lifetime)
            for<'a> &'a mut Func:
                FnMut($($P),*) -> Out + FnMut($(SystemParamItem<$P>),*) -> Out,
            Out: 'static,
        {
            type In = ();
            type Out = Out;
            type Param = ($($P,)*);

            fn run(&mut self, _input: (), param: SystemParamItem<($($P,)*)>) -> Out {
                fn call_inner<Out, $($P),*>(
                    mut f: impl FnMut($($P),*) -> Out,
                    $($P: $P),*
                ) -> Out {
                    f($($P),*)
                }
                let ($($P,)*) = param;
                call_inner(self, $($P),*)
            }
        }

        #[allow(non_snake_case)]
        impl<Input, Out, Func, $($P: SystemParam),*>
            SystemParamFunction<fn(In<Input>, $($P,)*) -> Out> for Func
        where
            Func: Send + Sync + 'static,
            for<'a> &'a mut Func:
                FnMut(In<Input>, $($P),*) -> Out
                    + FnMut(In<Input>, $(SystemParamItem<$P>),*) -> Out,
            Input: 'static,
            Out: 'static,
        {
            type In = Input;
            type Out = Out;
            type Param = ($($P,)*);

            fn run(&mut self, input: Input, param: SystemParamItem<($($P,)*)>) -> Out {
                fn call_inner<Input, Out, $($P),*>(
                    mut f: impl FnMut(In<Input>, $($P),*) -> Out,
                    input: In<Input>,
                    $($P: $P),*
                ) -> Out {
                    f(input, $($P),*)
                }
                let ($($P,)*) = param;
                call_inner(self, In(input), $($P),*)
            }
        }
    };
}

impl_system_function!();
impl_system_function!(A);
impl_system_function!(A, B);
impl_system_function!(A, B, C);
impl_system_function!(A, B, C, D);
impl_system_function!(A, B, C, D, E);
impl_system_function!(A, B, C, D, E, F);
impl_system_function!(A, B, C, D, E, F, G);
impl_system_function!(A, B, C, D, E, F, G, H);

/// Type-erased entry point for one user function.
///
/// Holds the function and exactly one state record per parameter,
/// built lazily on the first run.
pub struct FunctionSystem<Marker, F>
where
    F: SystemParamFunction<Marker, In = ()>,
{
    func: F,
    state: Option<<F::Param as SystemParam>::State>,
    name: &'static str,
    _marker: PhantomData<fn() -> Marker>,
}

impl<Marker, F> System for FunctionSystem<Marker, F>
where
    Marker: 'static,
    F: SystemParamFunction<Marker, In = ()>,
    F::Out: IntoSystemResult,
{
    fn name(&self) -> &str {
        self.name
    }

    fn run(&mut self, world: &mut World) -> Result<()> {
        if self.state.is_none() {
            self.state = Some(<F::Param as SystemParam>::init_state(world));
        }
        let state = self.state.as_mut().unwrap();

        let world_ptr = world as *mut World;
        let result = {
            // SAFETY: single-threaded execution; parameters of one call
            // access disjoint world data per the SystemParam contract
            let param = unsafe { <F::Param as SystemParam>::get_param(state, world_ptr)? };
            self.func.run((), param).into_system_result()
        };
        let teardown = <F::Param as SystemParam>::apply(state, world);
        result.and(teardown)
    }
}

/// Conversion of values into runnable systems.
///
/// Covers plain functions (through [`SystemParamFunction`]), anything
/// already implementing [`System`], and boxed handles.
pub trait IntoSystem<Marker> {
    type System: System;

    fn into_system(self) -> Self::System;
}

#[doc(hidden)]
pub struct IsFunctionSystem;

impl<Marker, F> IntoSystem<(IsFunctionSystem, Marker)> for F
where
    Marker: 'static,
    F: SystemParamFunction<Marker, In = ()>,
    F::Out: IntoSystemResult,
{
    type System = FunctionSystem<Marker, F>;

    fn into_system(self) -> Self::System {
        FunctionSystem {
            func: self,
            state: None,
            name: std::any::type_name::<F>(),
            _marker: PhantomData,
        }
    }
}

#[doc(hidden)]
pub struct AlreadyASystem;

impl<S: System> IntoSystem<AlreadyASystem> for S {
    type System = S;

    fn into_system(self) -> S {
        self
    }
}

/// Chain two functions: `first` runs, its return value feeds `second`'s
/// leading [`In`] parameter.
pub struct PipeSystem<MarkerA, MarkerB, A, B>
where
    A: SystemParamFunction<MarkerA, In = ()>,
    B: SystemParamFunction<MarkerB, In = A::Out>,
{
    first: A,
    second: B,
    first_state: Option<<A::Param as SystemParam>::State>,
    second_state: Option<<B::Param as SystemParam>::State>,
    name: String,
    _marker: PhantomData<fn() -> (MarkerA, MarkerB)>,
}

/// Compose `first` and `second` into one system; `first`'s output is
/// supplied as `second`'s piped input.
pub fn pipe<MarkerA, MarkerB, A, B>(first: A, second: B) -> PipeSystem<MarkerA, MarkerB, A, B>
where
    A: SystemParamFunction<MarkerA, In = ()>,
    B: SystemParamFunction<MarkerB, In = A::Out>,
{
    let name = format!(
        "pipe({}, {})",
        std::any::type_name::<A>(),
        std::any::type_name::<B>()
    );
    PipeSystem {
        first,
        second,
        first_state: None,
        second_state: None,
        name,
        _marker: PhantomData,
    }
}

impl<MarkerA, MarkerB, A, B> System for PipeSystem<MarkerA, MarkerB, A, B>
where
    MarkerA: 'static,
    MarkerB: 'static,
    A: SystemParamFunction<MarkerA, In = ()>,
    B: SystemParamFunction<MarkerB, In = A::Out>,
    B::Out: IntoSystemResult,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, world: &mut World) -> Result<()> {
        if self.first_state.is_none() {
            self.first_state = Some(<A::Param as SystemParam>::init_state(world));
        }
        if self.second_state.is_none() {
            self.second_state = Some(<B::Param as SystemParam>::init_state(world));
        }
        let world_ptr = world as *mut World;

        let first_state = self.first_state.as_mut().unwrap();
        let output = {
            // SAFETY: as in FunctionSystem::run
            let param = unsafe { <A::Param as SystemParam>::get_param(first_state, world_ptr)? };
            self.first.run((), param)
        };
        <A::Param as SystemParam>::apply(first_state, world)?;

        let second_state = self.second_state.as_mut().unwrap();
        let result = {
            // SAFETY: as above
            let param = unsafe { <B::Param as SystemParam>::get_param(second_state, world_ptr)? };
            self.second.run(output, param).into_system_result()
        };
        let teardown = <B::Param as SystemParam>::apply(second_state, world);
        result.and(teardown)
    }
}

/// Gate a system behind a `bool`-returning predicate function
pub struct RunIf<MarkerP, P, S>
where
    P: SystemParamFunction<MarkerP, In = (), Out = bool>,
{
    predicate: P,
    predicate_state: Option<<P::Param as SystemParam>::State>,
    system: S,
    name: String,
    _marker: PhantomData<fn() -> MarkerP>,
}

/// Run `system` only when `predicate` returns true
pub fn run_if<MarkerP, MarkerS, P, S>(
    predicate: P,
    system: S,
) -> RunIf<MarkerP, P, <S as IntoSystem<MarkerS>>::System>
where
    P: SystemParamFunction<MarkerP, In = (), Out = bool>,
    S: IntoSystem<MarkerS>,
{
    let name = format!("run_if({})", std::any::type_name::<P>());
    RunIf {
        predicate,
        predicate_state: None,
        system: system.into_system(),
        name,
        _marker: PhantomData,
    }
}

impl<MarkerP, P, S> System for RunIf<MarkerP, P, S>
where
    MarkerP: 'static,
    P: SystemParamFunction<MarkerP, In = (), Out = bool>,
    S: System,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, world: &mut World) -> Result<()> {
        if self.predicate_state.is_none() {
            self.predicate_state = Some(<P::Param as SystemParam>::init_state(world));
        }
        let world_ptr = world as *mut World;

        let state = self.predicate_state.as_mut().unwrap();
        let should_run = {
            // SAFETY: as in FunctionSystem::run
            let param = unsafe { <P::Param as SystemParam>::get_param(state, world_ptr)? };
            self.predicate.run((), param)
        };
        <P::Param as SystemParam>::apply(state, world)?;

        if should_run {
            self.system.run(world)
        } else {
            Ok(())
        }
    }
}
