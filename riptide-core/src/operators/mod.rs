//! Operators for transforming, combining and timing flows. Each operator
//! is an extension trait on [crate::flow::Flow]; `use riptide::operators::*`
//! brings the whole catalog into scope.
mod amb;
mod buffer;
mod combine_latest;
mod concat;
mod concat_eager;
mod debounce;
mod default_if_empty;
mod delay;
mod distinct;
mod filter;
mod flat_map;
mod group_by;
mod ignore_elements;
mod inspect;
mod map;
mod observe_on;
mod on_backpressure;
mod on_error;
mod reduce;
mod repeat;
mod retry;
mod sample;
mod scan;
mod skip;
mod skip_last;
mod skip_until;
mod skip_while;
mod subscribe_on;
mod switch_map;
mod take;
mod take_last;
mod take_until;
mod take_while;
mod throttle;
mod timeout;
mod window;
mod with_latest_from;
mod zip;

pub use buffer::Buffer;
pub use combine_latest::CombineLatest;
pub use concat::ConcatMap;
pub use concat_eager::ConcatMapEager;
pub use debounce::Debounce;
pub use default_if_empty::DefaultIfEmpty;
pub use delay::Delay;
pub use distinct::Distinct;
pub use filter::Filter;
pub use flat_map::FlatMap;
pub use group_by::{GroupBy, GroupedFlow};
pub use ignore_elements::IgnoreElements;
pub use inspect::Inspect;
pub use map::Map;
pub use observe_on::ObserveOn;
pub use on_backpressure::OnBackpressure;
pub use on_error::OnError;
pub use reduce::Reduce;
pub use repeat::Repeat;
pub use retry::Retry;
pub use sample::Sample;
pub use scan::Scan;
pub use skip::Skip;
pub use skip_last::SkipLast;
pub use skip_until::SkipUntil;
pub use skip_while::SkipWhile;
pub use subscribe_on::SubscribeOn;
pub use switch_map::SwitchMap;
pub use take::Take;
pub use take_last::TakeLast;
pub use take_until::TakeUntil;
pub use take_while::TakeWhile;
pub use throttle::Throttle;
pub use timeout::Timeout;
pub use window::Window;
pub use with_latest_from::WithLatestFrom;
pub use zip::Zip;

// marker sealing the operator traits to Flow
mod sealed {
    use crate::flow::Flow;

    pub trait Sealed {}

    impl<T> Sealed for Flow<T> {}
}
